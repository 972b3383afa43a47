//! Supertag Inheritance Resolver
//!
//! Resolves the `extends` DAG between supertags into descendant and ancestor
//! sets. A node tagged with a subtag is a member of every ancestor supertag.
//!
//! # Cache Invalidation
//!
//! Closures are memoized per supertag and dropped wholesale when:
//! - a `field:extends` property event is emitted, or
//! - a node taking part in the extends graph is deleted
//!
//! Each invalidation bumps [`InheritanceResolver::epoch`], which the
//! subscription service folds into its diff fast path.
//!
//! # Cycles
//!
//! Corrupted data may contain cycles. Traversal keeps a visited set, so it
//! always terminates, and a supertag is never its own descendant.

use crate::db::{
    EventFilter, EventSubscription, MutationEvent, MutationEventType, NodeStore, StoreState,
};
use crate::models::system::FIELD_EXTENDS;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

type Closure = Arc<BTreeSet<String>>;

/// Memoized resolver over the store's extends adjacency
pub struct InheritanceResolver {
    store: Arc<NodeStore>,
    descendants: RwLock<HashMap<String, Closure>>,
    ancestors: RwLock<HashMap<String, Closure>>,
    epoch: AtomicU64,
    subscriptions: Mutex<Vec<EventSubscription>>,
}

impl InheritanceResolver {
    /// Create a resolver and register its invalidation listeners.
    pub fn new(store: Arc<NodeStore>) -> Arc<Self> {
        let resolver = Arc::new(Self {
            store: store.clone(),
            descendants: RwLock::new(HashMap::new()),
            ancestors: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            subscriptions: Mutex::new(Vec::new()),
        });

        let bus = store.bus();
        let weak: Weak<Self> = Arc::downgrade(&resolver);
        let on_extends = bus.subscribe(Some(EventFilter::for_field(FIELD_EXTENDS)), move |event| {
            if let Some(resolver) = weak.upgrade() {
                resolver.on_extends_changed(event);
            }
            Ok(())
        });

        let weak: Weak<Self> = Arc::downgrade(&resolver);
        let on_delete = bus.subscribe(
            Some(EventFilter::for_types([MutationEventType::NodeDeleted])),
            move |event| {
                if let Some(resolver) = weak.upgrade() {
                    resolver.on_node_deleted(event);
                }
                Ok(())
            },
        );

        resolver
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([on_extends, on_delete]);
        resolver
    }

    fn on_extends_changed(&self, event: &MutationEvent) {
        if event.event_type.is_property_event() {
            tracing::debug!("extends edge changed on {}; invalidating closures", event.node_id);
            self.invalidate();
        }
    }

    fn on_node_deleted(&self, event: &MutationEvent) {
        let participates = self.store.read().in_extends_graph(&event.node_id);
        if participates {
            tracing::debug!("supertag {} deleted; invalidating closures", event.node_id);
            self.invalidate();
        }
    }

    /// Drop every memoized closure.
    pub fn invalidate(&self) {
        self.descendants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.ancestors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Incremented on every invalidation
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Transitive subtags of a supertag (node ids), excluding itself.
    ///
    /// Unknown or deleted supertags have no descendants.
    pub fn compute_descendants(&self, supertag_ref: &str) -> Closure {
        let state = self.store.read();
        self.descendants_in(&state, supertag_ref)
    }

    /// Transitive parents of a supertag (node ids), excluding itself.
    pub fn compute_ancestors(&self, supertag_ref: &str) -> Closure {
        let state = self.store.read();
        self.ancestors_in(&state, supertag_ref)
    }

    pub(crate) fn descendants_in(&self, state: &StoreState, supertag_ref: &str) -> Closure {
        let Some(root) = state.resolve_ref(supertag_ref).map(|n| n.id.clone()) else {
            return Closure::default();
        };
        if let Some(cached) = self
            .descendants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&root)
        {
            return cached.clone();
        }

        let closure = Arc::new(traverse(&root, |id| {
            state
                .extends_children(id)
                .map(|children| children.iter().cloned().collect())
                .unwrap_or_default()
        }));
        self.descendants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(root, closure.clone());
        closure
    }

    pub(crate) fn ancestors_in(&self, state: &StoreState, supertag_ref: &str) -> Closure {
        let Some(root) = state.resolve_ref(supertag_ref).map(|n| n.id.clone()) else {
            return Closure::default();
        };
        if let Some(cached) = self
            .ancestors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&root)
        {
            return cached.clone();
        }

        let closure = Arc::new(traverse(&root, |id| {
            state
                .extends_parents(id)
                .into_iter()
                .filter(|parent| state.live_node(parent).is_some())
                .collect()
        }));
        self.ancestors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(root, closure.clone());
        closure
    }

    /// Live nodes tagged with the supertag or any of its descendants.
    pub fn get_nodes_by_supertag_with_inheritance(&self, supertag_ref: &str) -> BTreeSet<String> {
        let state = self.store.read();
        self.nodes_with_inheritance_in(&state, supertag_ref)
    }

    pub(crate) fn nodes_with_inheritance_in(
        &self,
        state: &StoreState,
        supertag_ref: &str,
    ) -> BTreeSet<String> {
        let Some(root) = state.resolve_ref(supertag_ref).map(|n| n.id.clone()) else {
            return BTreeSet::new();
        };
        let mut nodes = state.tagged_with(&root).cloned().unwrap_or_default();
        for descendant in self.descendants_in(state, &root).iter() {
            if let Some(tagged) = state.tagged_with(descendant) {
                nodes.extend(tagged.iter().cloned());
            }
        }
        nodes
    }

    /// Supertags a node inherits through its direct supertags, excluding the
    /// direct ones, as node ids.
    pub(crate) fn inherited_supertags_in(&self, state: &StoreState, node_id: &str) -> Vec<String> {
        let direct = state.direct_supertags(node_id);
        let mut inherited = BTreeSet::new();
        for supertag in &direct {
            inherited.extend(self.ancestors_in(state, supertag).iter().cloned());
        }
        inherited
            .into_iter()
            .filter(|id| !direct.contains(id))
            .collect()
    }

    /// Unregister the invalidation listeners.
    pub fn detach(&self) {
        for subscription in self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            subscription.unsubscribe();
        }
    }
}

/// Breadth-first closure from `root`, excluding `root` itself.
fn traverse(root: &str, next: impl Fn(&str) -> Vec<String>) -> BTreeSet<String> {
    let mut visited = BTreeSet::new();
    visited.insert(root.to_string());
    let mut queue = VecDeque::from([root.to_string()]);

    while let Some(current) = queue.pop_front() {
        for neighbour in next(&current) {
            if visited.insert(neighbour.clone()) {
                queue.push_back(neighbour);
            }
        }
    }
    visited.remove(root);
    visited
}
