//! Node Data Structures
//!
//! This module defines the core `Node` and `Property` records that map onto
//! the two persisted tables (`nodes` and `node_properties`).
//!
//! # Architecture
//!
//! - **Universal Node**: one struct represents content, fields, and supertags
//! - **Schema-less values**: property values are arbitrary JSON
//! - **Schema-as-Node**: fields and supertags are nodes with a `system_id`
//! - **Soft delete**: `deleted_at` hides a node without removing its rows
//!
//! # Examples
//!
//! ```rust
//! use semgraph_core::models::Node;
//!
//! let note = Node::new(Some("Weekly review".to_string()), None);
//! assert!(note.system_id.is_none());
//! assert!(!note.is_deleted());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Validation errors for nodes and definitions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid system id: {0}")]
    InvalidSystemId(String),

    #[error("System id already in use: {0}")]
    DuplicateSystemId(String),

    #[error("Operator '{operator}' cannot be applied to {reason}")]
    UnsupportedOperator { operator: String, reason: String },

    #[error("Malformed query: {0}")]
    InvalidQuery(String),

    #[error("Malformed definition: {0}")]
    InvalidDefinition(String),
}

impl ValidationError {
    pub fn unsupported_operator(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedOperator {
            operator: operator.into(),
            reason: reason.into(),
        }
    }
}

/// A row of the `nodes` table.
///
/// # Fields
///
/// - `id`: Opaque unique identifier (UUID, or the system id for built-ins)
/// - `content`: Primary text of the node
/// - `content_plain`: Normalized text used by content search
/// - `system_id`: Stable, human-readable identifier (e.g. `field:status`)
/// - `owner_id`: Hierarchy parent
/// - `version`: Incremented on every observable change to the node, its
///   properties, or its supertag assignments
/// - `deleted_at`: Soft-delete marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_plain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    #[serde(default = "default_version")]
    pub version: i64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

fn default_version() -> i64 {
    1
}

impl Node {
    /// Create a new node with an auto-generated UUID.
    ///
    /// `content_plain` is derived from `content` via
    /// [`normalize_content`](crate::utils::normalize_content).
    pub fn new(content: Option<String>, owner_id: Option<String>) -> Self {
        Self::new_with_id(Uuid::new_v4().to_string(), content, owner_id)
    }

    /// Create a new node with an explicit id (used for built-ins, whose id is
    /// their system id).
    pub fn new_with_id(id: String, content: Option<String>, owner_id: Option<String>) -> Self {
        let now = Utc::now();
        let content_plain = content.as_deref().map(crate::utils::normalize_content);
        Self {
            id,
            content,
            content_plain,
            system_id: None,
            owner_id,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Builder-style system id assignment
    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = Some(system_id.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Key used for this node when it acts as a field or supertag reference:
    /// the system id when present, otherwise the node id.
    pub fn reference_key(&self) -> &str {
        self.system_id.as_deref().unwrap_or(&self.id)
    }

    /// Replace content and recompute the plain-text projection.
    pub(crate) fn set_content(&mut self, content: String) {
        self.content_plain = Some(crate::utils::normalize_content(&content));
        self.content = Some(content);
    }

    /// Mark an observable change at `now`.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

/// A row of the `node_properties` table.
///
/// Values carry no enforced type; a field's declared type is advisory
/// metadata stored on the field node itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: i64,
    pub node_id: String,
    pub field_node_id: String,
    pub value: Value,
    pub order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a node
///
/// Mirrors `createNode(content, supertagId?, ownerId?)` with an optional
/// explicit id and system id for schema nodes.
#[derive(Debug, Clone, Default)]
pub struct CreateNodeParams {
    pub id: Option<String>,
    pub content: Option<String>,
    pub system_id: Option<String>,
    pub supertag: Option<String>,
    pub owner_id: Option<String>,
}

impl CreateNodeParams {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_supertag(mut self, supertag: impl Into<String>) -> Self {
        self.supertag = Some(supertag.into());
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = Some(system_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_derives_plain_content() {
        let node = Node::new(Some("# Weekly **Review**".to_string()), None);
        assert_eq!(node.content_plain.as_deref(), Some("weekly review"));
        assert_eq!(node.version, 1);
        assert_eq!(node.created_at, node.updated_at);
    }

    #[test]
    fn test_reference_key_prefers_system_id() {
        let field = Node::new(Some("Status".to_string()), None).with_system_id("field:status");
        assert_eq!(field.reference_key(), "field:status");

        let anonymous = Node::new(None, None);
        assert_eq!(anonymous.reference_key(), anonymous.id);
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut node = Node::new(None, None);
        let later = node.updated_at + chrono::Duration::seconds(5);
        node.touch(later);
        assert_eq!(node.version, 2);
        assert_eq!(node.updated_at, later);
    }

    #[test]
    fn test_node_serialization_is_camel_case() {
        let node = Node::new(Some("x".to_string()), Some("owner-1".to_string()))
            .with_system_id("field:x");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["systemId"], "field:x");
        assert_eq!(json["ownerId"], "owner-1");
        assert!(json.get("deletedAt").is_none());
    }
}
