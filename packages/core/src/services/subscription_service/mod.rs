//! Query Subscription Service - Live Queries
//!
//! Keeps query results up to date as mutations land and reports incremental
//! diffs to subscribers.
//!
//! # Lifecycle
//!
//! 1. `subscribe` evaluates the query once and stores a snapshot of the
//!    result ids and their assembled nodes
//! 2. Every mutation event schedules the subscriptions it may affect
//!    (every subscription in brute-force mode)
//! 3. Scheduled subscriptions are re-evaluated once per debounce window,
//!    or immediately when the window is zero
//! 4. The new result is diffed against the snapshot; non-empty diffs are
//!    delivered to the callback and the snapshot is replaced
//!
//! # Incremental patching
//!
//! With smart invalidation, an event that neither creates nor deletes a node
//! nor edits the supertag hierarchy only schedules its own node. For a query
//! without a limit whose filters and sort read nothing but the matched node
//! ([`QueryDefinition::is_node_local`]), the flush then tests just the
//! scheduled nodes and patches the snapshot in place. Everything else is
//! evaluated from scratch; brute-force mode always is.
//!
//! # Concurrency
//!
//! Registration and timer-driven flushes hold the node store's write gate, so
//! they never interleave with writes. With a zero debounce window the flush
//! runs inside the emitting write. A re-evaluation lock orders flushes, so
//! diffs for one subscription arrive with non-decreasing `evaluated_at`.
//!
//! Callbacks run synchronously during a flush. They must not call
//! [`QuerySubscriptionService::flush_pending_mutations`] and cannot await
//! store writes; hand such work to a task or queue instead.

mod invalidation;

#[cfg(test)]
mod subscription_service_test;

use crate::db::{EventSubscription, MutationEvent};
use crate::models::AssembledNode;
use crate::services::error::GraphError;
use crate::services::query_service::{QueryDefinition, QueryReferences, QueryService};
use chrono::{DateTime, Utc};
use invalidation::EventScope;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Default batching window in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 10;

/// Callback invoked with every non-empty result diff
pub type ResultCallback = Arc<dyn Fn(&ResultChange) -> anyhow::Result<()> + Send + Sync>;

/// Incremental change of a subscription's result set
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultChange {
    pub subscription_id: String,
    /// Nodes that entered the result set
    pub added: Vec<AssembledNode>,
    /// Nodes that left the result set, as last seen
    pub removed: Vec<AssembledNode>,
    /// Nodes still in the result set whose assembled value differs
    pub changed: Vec<AssembledNode>,
    /// Full ordered result after the change
    #[serde(skip)]
    pub node_ids: Arc<Vec<String>>,
    pub total_count: usize,
    pub evaluated_at: DateTime<Utc>,
}

impl ResultChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Evaluation counters, for diagnostics and invalidation cost checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStats {
    /// Mutation events observed
    pub events: u64,
    /// Subscription schedulings caused by events
    pub scheduled: u64,
    /// Subscriptions smart invalidation decided not to schedule
    pub skipped: u64,
    /// Query re-evaluations performed
    pub evaluations: u64,
    /// Re-evaluations that only tested the changed nodes
    pub incremental: u64,
    /// Callbacks invoked with a non-empty diff
    pub notifications: u64,
}

#[derive(Default)]
struct StatCounters {
    events: AtomicU64,
    scheduled: AtomicU64,
    skipped: AtomicU64,
    evaluations: AtomicU64,
    incremental: AtomicU64,
    notifications: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            events: self.events.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            incremental: self.incremental.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.events,
            &self.scheduled,
            &self.skipped,
            &self.evaluations,
            &self.incremental,
            &self.notifications,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Work scheduled for one subscription
#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Full,
    /// Only these nodes changed since the snapshot
    Nodes(BTreeSet<String>),
}

impl Pending {
    fn merge(&mut self, other: Pending) {
        match (self, other) {
            (Pending::Nodes(nodes), Pending::Nodes(more)) => nodes.extend(more),
            (this, _) => *this = Pending::Full,
        }
    }
}

struct Snapshot {
    ids: Arc<Vec<String>>,
    /// Node version and assembled value per result id
    states: HashMap<String, (i64, AssembledNode)>,
    /// Inheritance epoch the states were assembled under
    epoch: u64,
    evaluated_at: DateTime<Utc>,
}

struct LiveSubscription {
    id: String,
    query: QueryDefinition,
    references: QueryReferences,
    /// Unlimited and node-local, see the module docs
    patchable: bool,
    callback: ResultCallback,
    active: AtomicBool,
    snapshot: Mutex<Snapshot>,
}

impl LiveSubscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live query service over the node store's event stream
pub struct QuerySubscriptionService {
    queries: Arc<QueryService>,
    subscriptions: RwLock<BTreeMap<String, Arc<LiveSubscription>>>,
    pending: Mutex<BTreeMap<String, Pending>>,
    timer_armed: AtomicBool,
    smart_invalidation: AtomicBool,
    debounce_ms: AtomicU64,
    evaluation: Mutex<()>,
    stats: StatCounters,
    listener: Mutex<Option<EventSubscription>>,
}

impl QuerySubscriptionService {
    /// Create the service and attach it to the store's event bus.
    ///
    /// Smart invalidation is on and the debounce window is
    /// [`DEFAULT_DEBOUNCE_MS`].
    pub fn new(queries: Arc<QueryService>) -> Arc<Self> {
        let service = Arc::new(Self {
            queries: queries.clone(),
            subscriptions: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            timer_armed: AtomicBool::new(false),
            smart_invalidation: AtomicBool::new(true),
            debounce_ms: AtomicU64::new(DEFAULT_DEBOUNCE_MS),
            evaluation: Mutex::new(()),
            stats: StatCounters::default(),
            listener: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&service);
        let listener = queries.store().bus().subscribe(None, move |event| {
            if let Some(service) = weak.upgrade() {
                service.on_event(event);
            }
            Ok(())
        });
        *service
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
        service
    }

    pub fn queries(&self) -> &Arc<QueryService> {
        &self.queries
    }

    //
    // CONFIGURATION
    //

    pub fn set_smart_invalidation(&self, enabled: bool) {
        self.smart_invalidation.store(enabled, Ordering::SeqCst);
        tracing::debug!("Smart invalidation {}", if enabled { "on" } else { "off" });
    }

    pub fn smart_invalidation(&self) -> bool {
        self.smart_invalidation.load(Ordering::SeqCst)
    }

    /// Set the batching window. Zero re-evaluates inside every write.
    pub fn set_debounce_ms(&self, debounce_ms: u64) {
        self.debounce_ms.store(debounce_ms, Ordering::SeqCst);
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce_ms.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    //
    // SUBSCRIBE / UNSUBSCRIBE
    //

    /// Register a live query.
    ///
    /// Evaluates the query immediately to seed the snapshot; the callback is
    /// only invoked for later changes.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Validation` for a malformed query.
    pub async fn subscribe<F>(
        self: &Arc<Self>,
        query: QueryDefinition,
        on_change: F,
    ) -> Result<SubscriptionHandle, GraphError>
    where
        F: Fn(&ResultChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let _gate = self.queries.store().exclusive().await;
        self.subscribe_locked(query, Arc::new(on_change))
    }

    /// Register a live query while the caller holds the write gate.
    pub(crate) fn subscribe_locked(
        self: &Arc<Self>,
        query: QueryDefinition,
        callback: ResultCallback,
    ) -> Result<SubscriptionHandle, GraphError> {
        query.validate()?;

        let snapshot = {
            let state = self.queries.store().read();
            let evaluated_at = Utc::now();
            let epoch = self.queries.resolver().epoch();
            let evaluated = self.queries.evaluate_ids_in(&state, &query, evaluated_at);
            let states = evaluated
                .ids
                .iter()
                .filter_map(|id| {
                    let assembled = self.queries.assemble_in(&state, id)?;
                    Some((id.clone(), (assembled.node.version, assembled)))
                })
                .collect();
            Snapshot {
                ids: Arc::new(evaluated.ids),
                states,
                epoch,
                evaluated_at,
            }
        };
        self.stats.evaluations.fetch_add(1, Ordering::Relaxed);

        let subscription = Arc::new(LiveSubscription {
            id: Uuid::new_v4().to_string(),
            references: query.references(),
            patchable: query.limit.is_none() && query.is_node_local(),
            query,
            callback,
            active: AtomicBool::new(true),
            snapshot: Mutex::new(snapshot),
        });
        tracing::debug!(
            "Subscription {} registered with {} initial results",
            subscription.id,
            subscription.snapshot().ids.len()
        );

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription.id.clone(), subscription.clone());

        Ok(SubscriptionHandle {
            subscription,
            service: Arc::downgrade(self),
        })
    }

    fn remove(&self, subscription_id: &str) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id);
    }

    //
    // SCHEDULING
    //

    fn on_event(self: &Arc<Self>, event: &MutationEvent) {
        self.stats.events.fetch_add(1, Ordering::Relaxed);

        let subscriptions: Vec<Arc<LiveSubscription>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        if subscriptions.is_empty() {
            return;
        }

        let scheduled: Vec<String> = if self.smart_invalidation() {
            let scope = {
                let state = self.queries.store().read();
                EventScope::resolve(event, &state, self.queries.resolver())
            };
            let work = if scope.is_node_local() {
                Pending::Nodes(BTreeSet::from([event.node_id.clone()]))
            } else {
                Pending::Full
            };
            let scheduled: Vec<String> = subscriptions
                .iter()
                .filter(|s| {
                    let in_results = s.snapshot().states.contains_key(&event.node_id);
                    scope.affects(&s.references, in_results)
                })
                .map(|s| s.id.clone())
                .collect();
            self.schedule(&scheduled, work);
            scheduled
        } else {
            let scheduled: Vec<String> = subscriptions.iter().map(|s| s.id.clone()).collect();
            self.schedule(&scheduled, Pending::Full);
            scheduled
        };

        self.stats
            .scheduled
            .fetch_add(scheduled.len() as u64, Ordering::Relaxed);
        self.stats
            .skipped
            .fetch_add((subscriptions.len() - scheduled.len()) as u64, Ordering::Relaxed);
        if scheduled.is_empty() {
            return;
        }

        match self.debounce_ms() {
            0 => {
                self.flush_pending_mutations();
            }
            debounce_ms => self.arm_timer(debounce_ms),
        }
    }

    fn schedule(&self, subscription_ids: &[String], work: Pending) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for id in subscription_ids {
            match pending.get_mut(id) {
                Some(scheduled) => scheduled.merge(work.clone()),
                None => {
                    pending.insert(id.clone(), work.clone());
                }
            }
        }
    }

    /// Start the batching timer unless one is already running.
    fn arm_timer(self: &Arc<Self>, debounce_ms: u64) {
        if self.timer_armed.swap(true, Ordering::SeqCst) {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No tokio runtime for the debounce timer; flushing inline");
                self.timer_armed.store(false, Ordering::SeqCst);
                self.flush_pending_mutations();
                return;
            }
        };

        let weak = Arc::downgrade(self);
        runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
            let Some(service) = weak.upgrade() else {
                return;
            };
            let _gate = service.queries.store().exclusive().await;
            service.timer_armed.store(false, Ordering::SeqCst);
            service.flush_pending_mutations();
        });
    }

    /// Re-evaluate every scheduled subscription now.
    ///
    /// Returns the number of re-evaluations performed.
    pub fn flush_pending_mutations(&self) -> usize {
        let _evaluation = self
            .evaluation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));

        let mut evaluated = 0;
        for (id, work) in pending {
            let Some(subscription) = self
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .cloned()
            else {
                continue;
            };
            if !subscription.is_active() {
                continue;
            }
            evaluated += 1;
            let change = match work {
                Pending::Nodes(nodes) if subscription.patchable => {
                    self.patch(&subscription, &nodes)
                }
                _ => self.reevaluate(&subscription),
            };
            if let Some(change) = change {
                self.deliver(&subscription, &change);
            }
        }
        evaluated
    }

    //
    // EVALUATION
    //

    /// Re-run the query and diff against the snapshot. `None` when nothing
    /// changed.
    fn reevaluate(&self, subscription: &LiveSubscription) -> Option<ResultChange> {
        self.stats.evaluations.fetch_add(1, Ordering::Relaxed);

        let state = self.queries.store().read();
        let epoch = self.queries.resolver().epoch();
        let mut guard = subscription.snapshot();
        let snapshot = &mut *guard;
        let evaluated_at = Utc::now().max(snapshot.evaluated_at);
        let evaluated = self
            .queries
            .evaluate_ids_in(&state, &subscription.query, evaluated_at);

        let mut states = HashMap::with_capacity(evaluated.ids.len());
        let mut added = Vec::new();
        let mut changed = Vec::new();
        for id in &evaluated.ids {
            let version = state.live_node(id).map(|n| n.version).unwrap_or_default();
            match snapshot.states.remove(id) {
                Some((old_version, old)) if old_version == version && snapshot.epoch == epoch => {
                    states.insert(id.clone(), (version, old));
                }
                Some((_, old)) => {
                    let Some(current) = self.queries.assemble_in(&state, id) else {
                        continue;
                    };
                    if current != old {
                        changed.push(current.clone());
                    }
                    states.insert(id.clone(), (version, current));
                }
                None => {
                    let Some(current) = self.queries.assemble_in(&state, id) else {
                        continue;
                    };
                    added.push(current.clone());
                    states.insert(id.clone(), (version, current));
                }
            }
        }
        drop(state);

        let removed: Vec<AssembledNode> = snapshot
            .ids
            .iter()
            .filter_map(|id| snapshot.states.remove(id).map(|(_, node)| node))
            .collect();

        snapshot.ids = Arc::new(evaluated.ids);
        snapshot.states = states;
        snapshot.epoch = epoch;
        snapshot.evaluated_at = evaluated_at;

        let change = ResultChange {
            subscription_id: subscription.id.clone(),
            added,
            removed,
            changed,
            node_ids: snapshot.ids.clone(),
            total_count: evaluated.total_count,
            evaluated_at,
        };
        (!change.is_empty()).then_some(change)
    }

    /// Re-test only `nodes`, which are the only nodes written since the
    /// snapshot, and patch the snapshot in place. Falls back to a full
    /// evaluation when the supertag hierarchy moved.
    fn patch(
        &self,
        subscription: &LiveSubscription,
        nodes: &BTreeSet<String>,
    ) -> Option<ResultChange> {
        let state = self.queries.store().read();
        let epoch = self.queries.resolver().epoch();
        let mut guard = subscription.snapshot();
        if guard.epoch != epoch {
            drop(guard);
            drop(state);
            return self.reevaluate(subscription);
        }
        self.stats.evaluations.fetch_add(1, Ordering::Relaxed);
        self.stats.incremental.fetch_add(1, Ordering::Relaxed);

        let snapshot = &mut *guard;
        let query = &subscription.query;
        let sorted = query.sort.is_some();
        let evaluated_at = Utc::now().max(snapshot.evaluated_at);
        let matched = self
            .queries
            .matching_of_in(&state, query, nodes, evaluated_at);

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();
        // Ids to take out of the ordered result, and to put back in
        let mut leaving: BTreeSet<&str> = BTreeSet::new();
        let mut entering: Vec<&str> = Vec::new();

        for node_id in nodes {
            let now_in = matched.contains(node_id.as_str());
            let current = now_in
                .then(|| self.queries.assemble_in(&state, node_id))
                .flatten();
            match (snapshot.states.remove(node_id), current) {
                (None, None) => {}
                (None, Some(current)) => {
                    added.push(current.clone());
                    snapshot
                        .states
                        .insert(node_id.clone(), (current.node.version, current));
                    entering.push(node_id);
                }
                (Some((_, old)), None) => {
                    removed.push(old);
                    leaving.insert(node_id);
                }
                (Some((version, old)), Some(current)) => {
                    if current.node.version == version {
                        snapshot.states.insert(node_id.clone(), (version, old));
                        continue;
                    }
                    if current != old {
                        changed.push(current.clone());
                    }
                    snapshot
                        .states
                        .insert(node_id.clone(), (current.node.version, current));
                    if sorted {
                        leaving.insert(node_id);
                        entering.push(node_id);
                    }
                }
            }
        }

        if sorted && removed.len() > 1 {
            let old_position: HashMap<&str, usize> = snapshot
                .ids
                .iter()
                .enumerate()
                .filter(|(_, id)| leaving.contains(id.as_str()))
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            removed.sort_by_key(|node| old_position.get(node.id()).copied());
        }

        if !leaving.is_empty() || !entering.is_empty() {
            let ids = Arc::make_mut(&mut snapshot.ids);
            if !leaving.is_empty() {
                ids.retain(|id| !leaving.contains(id.as_str()));
            }
            for node_id in entering {
                let at = self.queries.position_in(&state, query, ids, node_id);
                ids.insert(at, node_id.to_string());
            }
        }
        drop(state);

        if sorted && added.len() + changed.len() > 1 {
            let position: HashMap<&str, usize> = snapshot
                .ids
                .iter()
                .enumerate()
                .filter(|(_, id)| nodes.contains(*id))
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            added.sort_by_key(|node| position.get(node.id()).copied());
            changed.sort_by_key(|node| position.get(node.id()).copied());
        }

        snapshot.evaluated_at = evaluated_at;
        let change = ResultChange {
            subscription_id: subscription.id.clone(),
            added,
            removed,
            changed,
            node_ids: snapshot.ids.clone(),
            total_count: snapshot.ids.len(),
            evaluated_at,
        };
        (!change.is_empty()).then_some(change)
    }

    fn deliver(&self, subscription: &LiveSubscription, change: &ResultChange) {
        if !subscription.is_active() {
            return;
        }
        self.stats.notifications.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Subscription {}: +{} -{} ~{}",
            subscription.id,
            change.added.len(),
            change.removed.len(),
            change.changed.len()
        );

        match catch_unwind(AssertUnwindSafe(|| (subscription.callback)(change))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Subscription {} callback failed: {}", subscription.id, e)
            }
            Err(_) => tracing::error!("Subscription {} callback panicked", subscription.id),
        }
    }

    /// Detach from the event bus and deactivate every subscription.
    pub fn shutdown(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.unsubscribe();
        }
        let drained = std::mem::take(
            &mut *self
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subscription in drained.values() {
            subscription.active.store(false, Ordering::SeqCst);
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Handle to a live subscription
///
/// Dropping the handle does not unsubscribe.
#[derive(Clone)]
pub struct SubscriptionHandle {
    subscription: Arc<LiveSubscription>,
    service: Weak<QuerySubscriptionService>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.subscription.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.subscription.id
    }

    pub fn query(&self) -> &QueryDefinition {
        &self.subscription.query
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Stop delivery and remove the subscription, including from a pending
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::StaleSubscription` when already unsubscribed.
    pub fn unsubscribe(&self) -> Result<(), GraphError> {
        if !self.subscription.active.swap(false, Ordering::SeqCst) {
            return Err(GraphError::stale_subscription(&self.subscription.id));
        }
        if let Some(service) = self.service.upgrade() {
            service.remove(&self.subscription.id);
        }
        tracing::debug!("Subscription {} removed", self.subscription.id);
        Ok(())
    }

    /// Ordered ids of the last evaluated result.
    pub fn current_node_ids(&self) -> Result<Arc<Vec<String>>, GraphError> {
        if !self.is_active() {
            return Err(GraphError::stale_subscription(&self.subscription.id));
        }
        Ok(self.subscription.snapshot().ids.clone())
    }
}
