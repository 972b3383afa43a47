//! Mutation Events
//!
//! This module defines the events emitted by the [`NodeStore`] after every
//! durable write that changes observable state, and the filters listeners use
//! to select them on the [`EventBus`].
//!
//! # Event Flow
//!
//! 1. NodeStore commits a write to its storage backend
//! 2. The in-memory working set is updated
//! 3. Exactly one `MutationEvent` is emitted on the event bus
//! 4. Listeners (inheritance cache, subscription service, ...) react synchronously
//!
//! [`NodeStore`]: crate::db::NodeStore
//! [`EventBus`]: crate::db::EventBus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator of a mutation event (`node:created`, `property:set`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationEventType {
    #[serde(rename = "node:created")]
    NodeCreated,
    #[serde(rename = "node:updated")]
    NodeUpdated,
    #[serde(rename = "node:deleted")]
    NodeDeleted,
    #[serde(rename = "property:set")]
    PropertySet,
    #[serde(rename = "property:added")]
    PropertyAdded,
    #[serde(rename = "property:removed")]
    PropertyRemoved,
    #[serde(rename = "supertag:added")]
    SupertagAdded,
    #[serde(rename = "supertag:removed")]
    SupertagRemoved,
}

impl MutationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeCreated => "node:created",
            Self::NodeUpdated => "node:updated",
            Self::NodeDeleted => "node:deleted",
            Self::PropertySet => "property:set",
            Self::PropertyAdded => "property:added",
            Self::PropertyRemoved => "property:removed",
            Self::SupertagAdded => "supertag:added",
            Self::SupertagRemoved => "supertag:removed",
        }
    }

    /// Creation and deletion can change the membership of any query.
    pub fn changes_membership(&self) -> bool {
        matches!(self, Self::NodeCreated | Self::NodeDeleted)
    }

    pub fn is_property_event(&self) -> bool {
        matches!(
            self,
            Self::PropertySet | Self::PropertyAdded | Self::PropertyRemoved
        )
    }

    pub fn is_supertag_event(&self) -> bool {
        matches!(self, Self::SupertagAdded | Self::SupertagRemoved)
    }
}

impl std::fmt::Display for MutationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted after a durable store write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    #[serde(rename = "type")]
    pub event_type: MutationEventType,

    pub timestamp: DateTime<Utc>,

    pub node_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_system_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supertag_system_id: Option<String>,
}

impl MutationEvent {
    pub fn new(event_type: MutationEventType, node_id: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            node_id: node_id.into(),
            system_id: None,
            field_system_id: None,
            before_value: None,
            after_value: None,
            supertag_system_id: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_system_id(mut self, system_id: Option<String>) -> Self {
        self.system_id = system_id;
        self
    }

    pub fn with_field(mut self, field_system_id: impl Into<String>) -> Self {
        self.field_system_id = Some(field_system_id.into());
        self
    }

    pub fn with_supertag(mut self, supertag_system_id: impl Into<String>) -> Self {
        self.supertag_system_id = Some(supertag_system_id.into());
        self
    }

    pub fn with_values(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before_value = before;
        self.after_value = after;
        self
    }
}

/// Listener-side event selection. Every populated criterion must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<MutationEventType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_system_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supertag_system_id: Option<String>,
}

impl EventFilter {
    pub fn for_types(types: impl IntoIterator<Item = MutationEventType>) -> Self {
        Self {
            event_types: Some(types.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Default::default()
        }
    }

    pub fn for_field(field_system_id: impl Into<String>) -> Self {
        Self {
            field_system_id: Some(field_system_id.into()),
            ..Default::default()
        }
    }

    pub fn for_supertag(supertag_system_id: impl Into<String>) -> Self {
        Self {
            supertag_system_id: Some(supertag_system_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &MutationEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if node_id != &event.node_id {
                return false;
            }
        }
        if let Some(field) = &self.field_system_id {
            if event.field_system_id.as_ref() != Some(field) {
                return false;
            }
        }
        if let Some(supertag) = &self.supertag_system_id {
            if event.supertag_system_id.as_ref() != Some(supertag) {
                return false;
            }
        }
        true
    }
}
