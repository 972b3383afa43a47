//! StorageBackend Trait - Persistence Abstraction Layer
//!
//! This module defines the `StorageBackend` trait that abstracts durable
//! storage for the graph. The [`NodeStore`] owns the in-memory working set and
//! all business rules; backends only persist rows.
//!
//! # Architecture
//!
//! - **Abstraction Point**: Between NodeStore (rules, indexes, events) and storage
//! - **Multiple Backends**: libsql ([`TursoBackend`]) and an in-memory backend
//! - **Atomic Batches**: every store write is one [`WriteBatch`], committed as a
//!   unit before the working set is updated and before any event is emitted
//!
//! # Design Decisions
//!
//! 1. **Async-First**: All methods are async so file-backed engines can do I/O
//! 2. **Typed Errors**: Methods return [`DatabaseError`]; services wrap it
//! 3. **Opaque Automation State**: automation state is stored as JSON so the
//!    backend does not depend on service types
//!
//! [`NodeStore`]: crate::db::NodeStore
//! [`TursoBackend`]: crate::db::TursoBackend

use super::error::DatabaseError;
use crate::models::{Node, Property};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

/// A single row-level change
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or fully replace a node row
    UpsertNode(Node),
    /// Insert a property row (id assigned by the store)
    InsertProperty(Property),
    /// Delete every row of one field on one node
    DeleteProperties {
        node_id: String,
        field_node_id: String,
    },
    /// Delete one property row
    DeleteProperty { node_id: String, property_id: i64 },
}

/// Ordered set of row changes committed atomically
///
/// Node upserts are applied before property changes so foreign keys on
/// freshly created field nodes are satisfied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Ops in commit order: node upserts first, then property changes.
    pub fn ordered(&self) -> impl Iterator<Item = &WriteOp> {
        let nodes = self
            .ops
            .iter()
            .filter(|op| matches!(op, WriteOp::UpsertNode(_)));
        let rest = self
            .ops
            .iter()
            .filter(|op| !matches!(op, WriteOp::UpsertNode(_)));
        nodes.chain(rest)
    }
}

/// Everything a backend holds, as loaded at startup
#[derive(Debug, Clone, Default)]
pub struct StoredRows {
    pub nodes: Vec<Node>,
    pub properties: Vec<Property>,
}

/// Abstraction layer for graph persistence
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the store calls them from async
/// tasks that may move between threads.
///
/// # Method Categories
///
/// - **Rows**: `load`, `commit`
/// - **Automation state**: `load_automation_state`, `save_automation_state`
/// - **Lifecycle**: `close`
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load all node and property rows, including soft-deleted nodes.
    async fn load(&self) -> Result<StoredRows, DatabaseError>;

    /// Durably apply a batch. Either every op is applied or none is.
    async fn commit(&self, batch: &WriteBatch) -> Result<(), DatabaseError>;

    /// Persisted state of one automation, if any.
    async fn load_automation_state(&self, automation_id: &str)
        -> Result<Option<Value>, DatabaseError>;

    /// Insert or replace the persisted state of one automation.
    async fn save_automation_state(
        &self,
        automation_id: &str,
        state: &Value,
    ) -> Result<(), DatabaseError>;

    /// Release resources. Further calls may fail.
    async fn close(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Property rows are grouped by owning node, so field-level deletes touch
/// one node's rows only.
#[derive(Debug, Default)]
struct MemoryTables {
    nodes: BTreeMap<String, Node>,
    properties: HashMap<String, BTreeMap<i64, Property>>,
    property_owners: HashMap<i64, String>,
    automation_state: HashMap<String, Value>,
}

impl MemoryTables {
    fn remove_property(&mut self, property_id: i64) {
        if let Some(node_id) = self.property_owners.remove(&property_id) {
            if let Some(rows) = self.properties.get_mut(&node_id) {
                rows.remove(&property_id);
            }
        }
    }
}

/// Backend keeping rows in process memory.
///
/// Clones share the same tables, so a clone handed to a second store behaves
/// like reopening the same database.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<MemoryTables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self) -> Result<StoredRows, DatabaseError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let mut properties: Vec<Property> = tables
            .properties
            .values()
            .flat_map(|rows| rows.values().cloned())
            .collect();
        properties.sort_by_key(|p| p.id);
        Ok(StoredRows {
            nodes: tables.nodes.values().cloned().collect(),
            properties,
        })
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);

        // Validate first so a failing batch leaves the tables untouched
        for op in batch.ordered() {
            if let WriteOp::InsertProperty(property) = op {
                let node_known = |id: &str| {
                    tables.nodes.contains_key(id)
                        || batch
                            .ops
                            .iter()
                            .any(|o| matches!(o, WriteOp::UpsertNode(n) if n.id == id))
                };
                if !node_known(&property.node_id) || !node_known(&property.field_node_id) {
                    return Err(DatabaseError::constraint(
                        "node_properties",
                        format!("property {} references an unknown node", property.id),
                    ));
                }
                if tables.property_owners.contains_key(&property.id) {
                    return Err(DatabaseError::constraint(
                        "node_properties",
                        format!("duplicate property id {}", property.id),
                    ));
                }
            }
        }

        for op in batch.ordered() {
            match op {
                WriteOp::UpsertNode(node) => {
                    tables.nodes.insert(node.id.clone(), node.clone());
                }
                WriteOp::InsertProperty(property) => {
                    tables
                        .property_owners
                        .insert(property.id, property.node_id.clone());
                    tables
                        .properties
                        .entry(property.node_id.clone())
                        .or_default()
                        .insert(property.id, property.clone());
                }
                WriteOp::DeleteProperties {
                    node_id,
                    field_node_id,
                } => {
                    let doomed: Vec<i64> = tables
                        .properties
                        .get(node_id)
                        .into_iter()
                        .flat_map(|rows| rows.values())
                        .filter(|p| &p.field_node_id == field_node_id)
                        .map(|p| p.id)
                        .collect();
                    for property_id in doomed {
                        tables.remove_property(property_id);
                    }
                }
                WriteOp::DeleteProperty { property_id, .. } => {
                    tables.remove_property(*property_id);
                }
            }
        }
        Ok(())
    }

    async fn load_automation_state(
        &self,
        automation_id: &str,
    ) -> Result<Option<Value>, DatabaseError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.automation_state.get(automation_id).cloned())
    }

    async fn save_automation_state(
        &self,
        automation_id: &str,
        state: &Value,
    ) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables
            .automation_state
            .insert(automation_id.to_string(), state.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
