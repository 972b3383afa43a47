//! In-memory working set
//!
//! `StoreState` mirrors the persisted `nodes` / `node_properties` tables and
//! keeps the secondary indexes every read path relies on. It is only mutated
//! by applying a [`WriteBatch`] that the backend has already committed, so the
//! working set never runs ahead of durable storage.
//!
//! Indexes are rebuilt per touched node from a remembered footprint, which
//! keeps them exact under arbitrary sequences of writes.

use super::backend::{WriteBatch, WriteOp};
use crate::models::system::{is_structural_field, FIELD_EXTENDS, FIELD_SUPERTAG};
use crate::models::{Node, Property};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Index entries contributed by a single node
#[derive(Debug, Default, Clone)]
struct Footprint {
    system_id: Option<String>,
    owner_id: Option<String>,
    fields: Vec<String>,
    supertags: Vec<String>,
    extends: Vec<String>,
    references: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) nodes: HashMap<String, Node>,
    /// Property rows per node, sorted by (field, order, id)
    pub(crate) properties: HashMap<String, Vec<Property>>,
    /// Ids of non-deleted nodes, ordered
    pub(crate) live: BTreeSet<String>,
    /// system id -> node id, live nodes only
    system_ids: HashMap<String, String>,
    /// field node id -> live nodes with at least one value
    field_index: HashMap<String, BTreeSet<String>>,
    /// supertag node id -> live nodes directly tagged
    supertag_index: HashMap<String, BTreeSet<String>>,
    /// parent supertag id -> live child supertags
    extends_index: HashMap<String, BTreeSet<String>>,
    /// string property value -> live nodes holding it (structural fields excluded)
    reference_index: HashMap<String, BTreeSet<String>>,
    /// owner id -> live owned nodes
    owner_index: HashMap<String, BTreeSet<String>>,
    footprints: HashMap<String, Footprint>,
    next_property_id: i64,
}

impl StoreState {
    /// Build the working set from persisted rows.
    pub(crate) fn from_rows(nodes: Vec<Node>, properties: Vec<Property>) -> Self {
        let mut state = Self {
            next_property_id: 1,
            ..Default::default()
        };

        for property in properties {
            state.next_property_id = state.next_property_id.max(property.id + 1);
            state
                .properties
                .entry(property.node_id.clone())
                .or_default()
                .push(property);
        }
        for rows in state.properties.values_mut() {
            sort_rows(rows);
        }

        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        for node in nodes {
            state.nodes.insert(node.id.clone(), node);
        }
        for id in ids {
            state.reindex(&id);
        }
        state
    }

    /// Next unused property id.
    pub(crate) fn peek_property_ids(&self) -> i64 {
        self.next_property_id
    }

    /// Apply an already-committed batch.
    pub(crate) fn apply(&mut self, batch: &WriteBatch) {
        let mut touched = BTreeSet::new();
        for op in &batch.ops {
            match op {
                WriteOp::UpsertNode(node) => {
                    touched.insert(node.id.clone());
                    self.nodes.insert(node.id.clone(), node.clone());
                }
                WriteOp::InsertProperty(property) => {
                    touched.insert(property.node_id.clone());
                    self.next_property_id = self.next_property_id.max(property.id + 1);
                    let rows = self.properties.entry(property.node_id.clone()).or_default();
                    rows.push(property.clone());
                    sort_rows(rows);
                }
                WriteOp::DeleteProperties {
                    node_id,
                    field_node_id,
                } => {
                    touched.insert(node_id.clone());
                    if let Some(rows) = self.properties.get_mut(node_id) {
                        rows.retain(|p| &p.field_node_id != field_node_id);
                    }
                }
                WriteOp::DeleteProperty { node_id, property_id } => {
                    touched.insert(node_id.clone());
                    if let Some(rows) = self.properties.get_mut(node_id) {
                        rows.retain(|p| p.id != *property_id);
                    }
                }
            }
        }
        for id in touched {
            self.reindex(&id);
        }
    }

    fn reindex(&mut self, node_id: &str) {
        if let Some(old) = self.footprints.remove(node_id) {
            if let Some(system_id) = &old.system_id {
                if self.system_ids.get(system_id).map(String::as_str) == Some(node_id) {
                    self.system_ids.remove(system_id);
                }
            }
            if let Some(owner) = &old.owner_id {
                remove_from(&mut self.owner_index, owner, node_id);
            }
            for key in &old.fields {
                remove_from(&mut self.field_index, key, node_id);
            }
            for key in &old.supertags {
                remove_from(&mut self.supertag_index, key, node_id);
            }
            for key in &old.extends {
                remove_from(&mut self.extends_index, key, node_id);
            }
            for key in &old.references {
                remove_from(&mut self.reference_index, key, node_id);
            }
        }

        let Some(node) = self.nodes.get(node_id) else {
            self.live.remove(node_id);
            return;
        };
        if node.is_deleted() {
            self.live.remove(node_id);
            return;
        }
        self.live.insert(node_id.to_string());

        let mut footprint = Footprint {
            system_id: node.system_id.clone(),
            owner_id: node.owner_id.clone(),
            ..Default::default()
        };
        for property in self.properties.get(node_id).map(Vec::as_slice).unwrap_or(&[]) {
            if !footprint.fields.contains(&property.field_node_id) {
                footprint.fields.push(property.field_node_id.clone());
            }
            let Some(text) = property.value.as_str() else {
                continue;
            };
            let bucket = match property.field_node_id.as_str() {
                FIELD_SUPERTAG => &mut footprint.supertags,
                FIELD_EXTENDS => &mut footprint.extends,
                _ => &mut footprint.references,
            };
            if !bucket.iter().any(|v| v == text) {
                bucket.push(text.to_string());
            }
        }

        if let Some(system_id) = &footprint.system_id {
            self.system_ids
                .insert(system_id.clone(), node_id.to_string());
        }
        if let Some(owner) = &footprint.owner_id {
            insert_into(&mut self.owner_index, owner, node_id);
        }
        for key in &footprint.fields {
            insert_into(&mut self.field_index, key, node_id);
        }
        for key in &footprint.supertags {
            insert_into(&mut self.supertag_index, key, node_id);
        }
        for key in &footprint.extends {
            insert_into(&mut self.extends_index, key, node_id);
        }
        for key in &footprint.references {
            insert_into(&mut self.reference_index, key, node_id);
        }
        self.footprints.insert(node_id.to_string(), footprint);
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub(crate) fn live_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id).filter(|n| !n.is_deleted())
    }

    pub(crate) fn node_by_system_id(&self, system_id: &str) -> Option<&Node> {
        self.system_ids
            .get(system_id)
            .and_then(|id| self.live_node(id))
    }

    /// Resolve a field or supertag reference (system id first, then node id).
    pub(crate) fn resolve_ref(&self, reference: &str) -> Option<&Node> {
        self.node_by_system_id(reference)
            .or_else(|| self.live_node(reference))
    }

    pub(crate) fn rows(&self, node_id: &str) -> &[Property] {
        self.properties
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Values of one field on one node, in order.
    pub(crate) fn values(&self, node_id: &str, field_node_id: &str) -> Vec<Value> {
        self.rows(node_id)
            .iter()
            .filter(|p| p.field_node_id == field_node_id)
            .map(|p| p.value.clone())
            .collect()
    }

    /// Event payload view: `None` when empty, the value itself when single,
    /// an array otherwise.
    pub(crate) fn read_value(&self, node_id: &str, field_node_id: &str) -> Option<Value> {
        let mut values = self.values(node_id, field_node_id);
        match values.len() {
            0 => None,
            1 => values.pop(),
            _ => Some(Value::Array(values)),
        }
    }

    pub(crate) fn max_order(&self, node_id: &str, field_node_id: &str) -> Option<i64> {
        self.rows(node_id)
            .iter()
            .filter(|p| p.field_node_id == field_node_id)
            .map(|p| p.order)
            .max()
    }

    /// Directly assigned supertag ids in assignment order.
    pub(crate) fn direct_supertags(&self, node_id: &str) -> Vec<String> {
        self.values(node_id, FIELD_SUPERTAG)
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    /// Parents named by a supertag's `extends` values.
    pub(crate) fn extends_parents(&self, supertag_id: &str) -> Vec<String> {
        self.values(supertag_id, FIELD_EXTENDS)
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub(crate) fn extends_children(&self, supertag_id: &str) -> Option<&BTreeSet<String>> {
        self.extends_index.get(supertag_id)
    }

    /// True when the node takes part in the extends graph either way.
    pub(crate) fn in_extends_graph(&self, node_id: &str) -> bool {
        self.extends_index.contains_key(node_id)
            || self
                .rows(node_id)
                .iter()
                .any(|p| p.field_node_id == FIELD_EXTENDS)
    }

    pub(crate) fn tagged_with(&self, supertag_id: &str) -> Option<&BTreeSet<String>> {
        self.supertag_index.get(supertag_id)
    }

    pub(crate) fn with_field(&self, field_node_id: &str) -> Option<&BTreeSet<String>> {
        self.field_index.get(field_node_id)
    }

    pub(crate) fn referencing(&self, target_id: &str) -> Option<&BTreeSet<String>> {
        self.reference_index.get(target_id)
    }

    pub(crate) fn owned_by(&self, owner_id: &str) -> Option<&BTreeSet<String>> {
        self.owner_index.get(owner_id)
    }

    /// Live node ids referenced by a node's non-structural string values.
    pub(crate) fn outgoing_links(&self, node_id: &str) -> BTreeSet<&str> {
        self.link_values(node_id)
            .filter_map(|target| self.live.get(target).map(String::as_str))
            .collect()
    }

    pub(crate) fn has_outgoing_links(&self, node_id: &str) -> bool {
        self.link_values(node_id)
            .any(|target| self.live.contains(target))
    }

    fn link_values<'s>(&'s self, node_id: &str) -> impl Iterator<Item = &'s str> + 's {
        self.rows(node_id)
            .iter()
            .filter(|p| !is_structural_field(&p.field_node_id))
            .filter_map(|p| p.value.as_str())
    }

    /// Reference key of a node: its system id when present, else its id.
    /// Used for assembled property maps and supertag lists.
    pub(crate) fn reference_key(&self, node_id: &str) -> String {
        self.nodes
            .get(node_id)
            .map(|n| n.reference_key().to_string())
            .unwrap_or_else(|| node_id.to_string())
    }

    /// Properties grouped by field key, excluding supertag assignments.
    pub(crate) fn property_map(&self, node_id: &str) -> BTreeMap<String, Vec<Value>> {
        let mut map: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for property in self.rows(node_id) {
            if property.field_node_id == FIELD_SUPERTAG {
                continue;
            }
            map.entry(self.reference_key(&property.field_node_id))
                .or_default()
                .push(property.value.clone());
        }
        map
    }
}

fn sort_rows(rows: &mut [Property]) {
    rows.sort_by(|a, b| {
        a.field_node_id
            .cmp(&b.field_node_id)
            .then(a.order.cmp(&b.order))
            .then(a.id.cmp(&b.id))
    });
}

fn insert_into(index: &mut HashMap<String, BTreeSet<String>>, key: &str, node_id: &str) {
    index
        .entry(key.to_string())
        .or_default()
        .insert(node_id.to_string());
}

fn remove_from(index: &mut HashMap<String, BTreeSet<String>>, key: &str, node_id: &str) {
    if let Some(set) = index.get_mut(key) {
        set.remove(node_id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}
