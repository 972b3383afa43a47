//! Smart invalidation
//!
//! Decides, per mutation event, which live subscriptions could observe a
//! different result. The event is resolved against the store once
//! ([`EventScope::resolve`]) and then checked against each subscription's
//! statically extracted [`QueryReferences`].
//!
//! A subscription is scheduled when any of these hold:
//!
//! - the event creates or deletes a node
//! - the event's node is in the subscription's last results
//! - the event's field matches a referenced field (by node id or system id)
//! - the event's supertag, or one of its ancestors, matches a referenced
//!   supertag (ancestors only for references that include inheritance)
//! - the event edits an `extends` edge
//! - content changed and the query reads content
//! - a property changed and the query follows links
//! - the query depends on timestamps that every write moves

use crate::db::{MutationEvent, MutationEventType, StoreState};
use crate::models::system::FIELD_EXTENDS;
use crate::services::inheritance::InheritanceResolver;
use crate::services::query_service::QueryReferences;

/// Store-resolved view of one mutation event
#[derive(Debug, Clone)]
pub(crate) struct EventScope {
    event_type: MutationEventType,
    /// Node id and system id of the event's field
    field_keys: Vec<String>,
    /// Node id and system id of the event's supertag
    supertag_keys: Vec<String>,
    /// `supertag_keys` plus the keys of every ancestor supertag
    lineage_keys: Vec<String>,
    extends_edge: bool,
}

impl EventScope {
    pub(crate) fn resolve(
        event: &MutationEvent,
        state: &StoreState,
        resolver: &InheritanceResolver,
    ) -> Self {
        let field_keys = event
            .field_system_id
            .as_deref()
            .map(|key| keys_of(state, key))
            .unwrap_or_default();

        let (supertag_keys, lineage_keys) = match event.supertag_system_id.as_deref() {
            Some(key) => {
                let direct = keys_of(state, key);
                let mut lineage = direct.clone();
                for ancestor in resolver.ancestors_in(state, key).iter() {
                    lineage.extend(keys_of(state, ancestor));
                }
                (direct, lineage)
            }
            None => (Vec::new(), Vec::new()),
        };

        let extends_edge = event.field_system_id.as_deref() == Some(FIELD_EXTENDS)
            || field_keys.iter().any(|k| k == FIELD_EXTENDS);

        Self {
            event_type: event.event_type,
            field_keys,
            supertag_keys,
            lineage_keys,
            extends_edge,
        }
    }

    /// True when the event can only change whether and how its own node
    /// matches a node-local query.
    pub(crate) fn is_node_local(&self) -> bool {
        !self.event_type.changes_membership() && !self.extends_edge
    }

    /// True when a subscription with these references must be re-evaluated.
    pub(crate) fn affects(&self, refs: &QueryReferences, in_results: bool) -> bool {
        if self.event_type.changes_membership() || in_results || self.extends_edge {
            return true;
        }
        if refs.time_dependent {
            return true;
        }
        if self.event_type == MutationEventType::NodeUpdated && refs.content {
            return true;
        }
        if self.event_type.is_property_event() && refs.links {
            return true;
        }
        if self.field_keys.iter().any(|k| refs.fields.contains(k)) {
            return true;
        }
        self.supertag_keys.iter().any(|k| refs.supertags.contains(k))
            || self
                .lineage_keys
                .iter()
                .any(|k| refs.inherited_supertags.contains(k))
    }
}

/// Every key a reference may be spelled with.
fn keys_of(state: &StoreState, reference: &str) -> Vec<String> {
    let mut keys = vec![reference.to_string()];
    if let Some(node) = state.resolve_ref(reference) {
        for key in [Some(&node.id), node.system_id.as_ref()].into_iter().flatten() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn scope(event_type: MutationEventType) -> EventScope {
        EventScope {
            event_type,
            field_keys: Vec::new(),
            supertag_keys: Vec::new(),
            lineage_keys: Vec::new(),
            extends_edge: false,
        }
    }

    fn refs_with_field(field: &str) -> QueryReferences {
        QueryReferences {
            fields: BTreeSet::from([field.to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn test_membership_events_always_schedule() {
        let refs = QueryReferences::default();
        assert!(scope(MutationEventType::NodeCreated).affects(&refs, false));
        assert!(scope(MutationEventType::NodeDeleted).affects(&refs, false));
        assert!(!scope(MutationEventType::NodeUpdated).affects(&refs, false));
    }

    #[test]
    fn test_events_on_result_nodes_schedule() {
        let refs = QueryReferences::default();
        assert!(scope(MutationEventType::PropertySet).affects(&refs, true));
    }

    #[test]
    fn test_field_matching_uses_every_key() {
        let mut event = scope(MutationEventType::PropertySet);
        event.field_keys = vec!["field:status".into(), "3f2c".into()];
        assert!(event.affects(&refs_with_field("3f2c"), false));
        assert!(event.affects(&refs_with_field("field:status"), false));
        assert!(!event.affects(&refs_with_field("field:priority"), false));
    }

    #[test]
    fn test_inherited_supertags_follow_lineage() {
        let mut event = scope(MutationEventType::SupertagAdded);
        event.supertag_keys = vec!["supertag:bug".into()];
        event.lineage_keys = vec!["supertag:bug".into(), "supertag:issue".into()];

        let inherited = QueryReferences {
            inherited_supertags: BTreeSet::from(["supertag:issue".to_string()]),
            ..Default::default()
        };
        assert!(event.affects(&inherited, false));

        let direct = QueryReferences {
            supertags: BTreeSet::from(["supertag:issue".to_string()]),
            ..Default::default()
        };
        assert!(!event.affects(&direct, false));
    }

    #[test]
    fn test_content_and_links_flags() {
        let content = QueryReferences {
            content: true,
            ..Default::default()
        };
        assert!(scope(MutationEventType::NodeUpdated).affects(&content, false));
        assert!(!scope(MutationEventType::PropertySet).affects(&content, false));

        let links = QueryReferences {
            links: true,
            ..Default::default()
        };
        assert!(scope(MutationEventType::PropertyAdded).affects(&links, false));
        assert!(!scope(MutationEventType::SupertagAdded).affects(&links, false));
    }

    #[test]
    fn test_node_local_events() {
        assert!(scope(MutationEventType::PropertySet).is_node_local());
        assert!(scope(MutationEventType::SupertagRemoved).is_node_local());
        assert!(!scope(MutationEventType::NodeCreated).is_node_local());
        assert!(!scope(MutationEventType::NodeDeleted).is_node_local());

        let mut extends = scope(MutationEventType::PropertyAdded);
        extends.extends_edge = true;
        assert!(!extends.is_node_local());
    }
}
