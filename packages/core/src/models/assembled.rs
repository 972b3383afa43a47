//! Assembled (materialized) node view
//!
//! An `AssembledNode` is never stored. It is built from a node row, its
//! supertag assignments, the supertags it inherits through `extends`, and its
//! properties grouped by field. Subscription diffs compare assembled nodes by
//! deep equality.

use super::node::Node;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledNode {
    #[serde(flatten)]
    pub node: Node,

    /// Directly assigned supertag ids, in assignment order
    pub supertags: Vec<String>,

    /// Ancestor supertags reached through `extends`, excluding direct ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherited_supertags: Vec<String>,

    /// Property values keyed by field system id (or field node id), in order
    pub properties: BTreeMap<String, Vec<Value>>,
}

impl AssembledNode {
    pub fn id(&self) -> &str {
        &self.node.id
    }

    /// First value for a field key, following the single-valued convention.
    pub fn value(&self, field_key: &str) -> Option<&Value> {
        self.properties.get(field_key).and_then(|values| values.first())
    }

    pub fn values(&self, field_key: &str) -> &[Value] {
        self.properties
            .get(field_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// True when the node carries the supertag directly or by inheritance.
    pub fn has_supertag(&self, supertag_id: &str) -> bool {
        self.supertags.iter().any(|s| s == supertag_id)
            || self.inherited_supertags.iter().any(|s| s == supertag_id)
    }
}
