//! Built-in System Nodes
//!
//! Canonical definitions for the fields and supertags that ship with every
//! store. They are seeded once by [`NodeStore::bootstrap`] before any user data
//! exists. Built-in node ids equal their system ids, so they can be referenced
//! directly without a lookup.
//!
//! ## Supertags
//!
//! - **Item** - generic content
//! - **Tag** - marks a node as a supertag
//! - **Field** - marks a node as a field definition
//! - **Command** - executable command nodes
//! - **Automation** / **Computed field** - stored rule and aggregate definitions
//!
//! [`NodeStore::bootstrap`]: crate::db::NodeStore::bootstrap

/// Field holding supertag assignments (value = supertag node id)
pub const FIELD_SUPERTAG: &str = "field:supertag";
/// Field holding `extends` edges on supertag nodes (value = parent supertag id)
pub const FIELD_EXTENDS: &str = "field:extends";
/// Advisory value type declared on field nodes
pub const FIELD_FIELD_TYPE: &str = "field:field-type";
/// Serialized `AutomationDefinition` on automation nodes
pub const FIELD_AUTOMATION_DEFINITION: &str = "field:automation-definition";
/// Serialized `ComputedFieldDefinition` on computed field nodes
pub const FIELD_COMPUTED_DEFINITION: &str = "field:computed-definition";

pub const SUPERTAG_ITEM: &str = "supertag:item";
pub const SUPERTAG_TAG: &str = "supertag:tag";
pub const SUPERTAG_FIELD: &str = "supertag:field";
pub const SUPERTAG_COMMAND: &str = "supertag:command";
pub const SUPERTAG_AUTOMATION: &str = "supertag:automation";
pub const SUPERTAG_COMPUTED_FIELD: &str = "supertag:computed-field";

/// Sentinel resolved to the current timestamp when an automation action runs
pub const NOW_MARKER: &str = "$now";

/// Kind of built-in node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemNodeKind {
    Field,
    Supertag,
}

/// Definition of a seeded node
#[derive(Debug, Clone, Copy)]
pub struct SystemNode {
    pub system_id: &'static str,
    pub name: &'static str,
    pub kind: SystemNodeKind,
    /// Advisory value type for fields
    pub field_type: Option<&'static str>,
}

/// All built-in nodes in seeding order.
///
/// `field:supertag` comes first because every other built-in is tagged
/// through it.
pub fn system_nodes() -> Vec<SystemNode> {
    use SystemNodeKind::*;

    let field = |system_id, name, field_type| SystemNode {
        system_id,
        name,
        kind: Field,
        field_type: Some(field_type),
    };
    let supertag = |system_id, name| SystemNode {
        system_id,
        name,
        kind: Supertag,
        field_type: None,
    };

    vec![
        field(FIELD_SUPERTAG, "Supertag", "reference"),
        field(FIELD_EXTENDS, "Extends", "reference"),
        field(FIELD_FIELD_TYPE, "Field type", "text"),
        field(FIELD_AUTOMATION_DEFINITION, "Automation definition", "json"),
        field(FIELD_COMPUTED_DEFINITION, "Computed field definition", "json"),
        supertag(SUPERTAG_ITEM, "Item"),
        supertag(SUPERTAG_TAG, "Tag"),
        supertag(SUPERTAG_FIELD, "Field"),
        supertag(SUPERTAG_COMMAND, "Command"),
        supertag(SUPERTAG_AUTOMATION, "Automation"),
        supertag(SUPERTAG_COMPUTED_FIELD, "Computed field"),
    ]
}

/// Fields whose values are structural edges rather than user links.
pub fn is_structural_field(field_node_id: &str) -> bool {
    field_node_id == FIELD_SUPERTAG || field_node_id == FIELD_EXTENDS
}
