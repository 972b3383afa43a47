//! Node Store
//!
//! CRUD over nodes, ordered multi-valued properties, and supertag assignment.
//!
//! # Write Path
//!
//! Every write follows the same sequence while holding the write gate:
//!
//! 1. Plan a [`WriteBatch`] against a read snapshot of the working set
//! 2. Commit the batch to the [`StorageBackend`]
//! 3. Apply the batch to the in-memory working set
//! 4. Emit exactly one [`MutationEvent`] per observable change
//!
//! Writes that would change nothing emit nothing. Writing to an unknown field
//! reference first materializes a field node, which emits its own
//! `node:created` event.
//!
//! # Concurrency
//!
//! The write gate (`tokio::sync::Mutex`) is the single serialization point of
//! the graph: store writes, subscription registration and batched
//! re-evaluation all hold it. Reads take a short `std::sync::RwLock` read lock
//! and never wait on the gate.
//!
//! # Examples
//!
//! ```rust,no_run
//! use semgraph_core::db::{EventBus, MemoryBackend, NodeStore};
//! use semgraph_core::models::CreateNodeParams;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = NodeStore::open(Arc::new(MemoryBackend::new()), EventBus::new()).await?;
//!     store.bootstrap().await?;
//!
//!     let task = store.create_node(CreateNodeParams::new("Write docs")).await?;
//!     store.set_property(&task.id, "field:status", json!("open")).await?;
//!     assert_eq!(store.get_property(&task.id, "field:status"), Some(json!("open")));
//!     Ok(())
//! }
//! ```

use super::backend::{StorageBackend, WriteBatch, WriteOp};
use super::event_bus::EventBus;
use super::events::{MutationEvent, MutationEventType};
use super::tables::StoreState;
use crate::models::system::{
    system_nodes, SystemNodeKind, FIELD_EXTENDS, FIELD_FIELD_TYPE, FIELD_SUPERTAG, SUPERTAG_FIELD,
    SUPERTAG_TAG,
};
use crate::models::{CreateNodeParams, Node, Property, ValidationError};
use crate::services::GraphError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Reactive node store over a pluggable storage backend
pub struct NodeStore {
    state: RwLock<StoreState>,
    backend: Arc<dyn StorageBackend>,
    bus: Arc<EventBus>,
    write_gate: Mutex<()>,
}

/// Row builder shared by the write planners
struct BatchPlanner {
    batch: WriteBatch,
    next_property_id: i64,
    now: DateTime<Utc>,
}

impl BatchPlanner {
    fn new(state: &StoreState) -> Self {
        Self {
            batch: WriteBatch::new(),
            next_property_id: state.peek_property_ids(),
            now: Utc::now(),
        }
    }

    fn upsert(&mut self, node: Node) {
        self.batch.push(WriteOp::UpsertNode(node));
    }

    fn insert(&mut self, node_id: &str, field_node_id: &str, value: Value, order: i64) {
        let property = Property {
            id: self.next_property_id,
            node_id: node_id.to_string(),
            field_node_id: field_node_id.to_string(),
            value,
            order,
            created_at: self.now,
            updated_at: self.now,
        };
        self.next_property_id += 1;
        self.batch.push(WriteOp::InsertProperty(property));
    }

    fn delete_field(&mut self, node_id: &str, field_node_id: &str) {
        self.batch.push(WriteOp::DeleteProperties {
            node_id: node_id.to_string(),
            field_node_id: field_node_id.to_string(),
        });
    }

    fn delete_row(&mut self, node_id: &str, property_id: i64) {
        self.batch.push(WriteOp::DeleteProperty {
            node_id: node_id.to_string(),
            property_id,
        });
    }

    /// Bump version and timestamp of a node touched by this batch.
    fn touch(&mut self, node: &Node) {
        let mut touched = node.clone();
        touched.touch(self.now);
        self.upsert(touched);
    }
}

fn validate_system_id(system_id: &str) -> Result<(), ValidationError> {
    if system_id.trim().is_empty() || system_id.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidSystemId(system_id.to_string()));
    }
    Ok(())
}

impl NodeStore {
    /// Open a store over `backend`, loading every persisted row into the
    /// working set.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>, GraphError> {
        let rows = backend.load().await?;
        let state = StoreState::from_rows(rows.nodes, rows.properties);
        tracing::info!(
            "NodeStore opened on {} backend with {} live nodes",
            backend.name(),
            state.live.len()
        );

        Ok(Arc::new(Self {
            state: RwLock::new(state),
            backend,
            bus,
            write_gate: Mutex::new(()),
        }))
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Acquire the write gate.
    ///
    /// While the guard is held no store write, subscription registration or
    /// batched re-evaluation can run. Calling a store write while holding the
    /// guard deadlocks.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Durably commit, apply to the working set, then emit.
    async fn commit(&self, batch: WriteBatch, events: Vec<MutationEvent>) -> Result<(), GraphError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.backend.commit(&batch).await?;
        self.write_state().apply(&batch);

        for event in &events {
            tracing::debug!("{} on {}", event.event_type, event.node_id);
            self.bus.emit(event);
        }
        Ok(())
    }

    //
    // BOOTSTRAP
    //

    /// Seed the built-in fields and supertags.
    ///
    /// Idempotent: nodes that already exist are left untouched. Returns the
    /// number of nodes created.
    pub async fn bootstrap(&self) -> Result<usize, GraphError> {
        let _gate = self.write_gate.lock().await;

        let (batch, events) = {
            let state = self.read();
            let mut planner = BatchPlanner::new(&state);
            let mut events = Vec::new();

            for system in system_nodes() {
                if state.nodes.contains_key(system.system_id) {
                    continue;
                }
                let node = Node::new_with_id(
                    system.system_id.to_string(),
                    Some(system.name.to_string()),
                    None,
                )
                .with_system_id(system.system_id);

                let tag = match system.kind {
                    SystemNodeKind::Field => SUPERTAG_FIELD,
                    SystemNodeKind::Supertag => SUPERTAG_TAG,
                };
                planner.insert(&node.id, FIELD_SUPERTAG, Value::String(tag.to_string()), 0);
                if let Some(field_type) = system.field_type {
                    planner.insert(
                        &node.id,
                        FIELD_FIELD_TYPE,
                        Value::String(field_type.to_string()),
                        0,
                    );
                }

                events.push(
                    MutationEvent::new(MutationEventType::NodeCreated, &node.id)
                        .with_timestamp(planner.now)
                        .with_system_id(node.system_id.clone())
                        .with_supertag(tag),
                );
                planner.upsert(node);
            }
            (planner.batch, events)
        };

        let created = events.len();
        self.commit(batch, events).await?;
        if created > 0 {
            tracing::info!("Bootstrapped {} built-in nodes", created);
        }
        Ok(created)
    }

    //
    // NODE OPERATIONS
    //

    /// Create a node, optionally tagged and owned.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed or duplicate system id, or a reused node id
    /// - `NotFound` for an unknown owner or supertag
    pub async fn create_node(&self, params: CreateNodeParams) -> Result<Node, GraphError> {
        let _gate = self.write_gate.lock().await;
        self.create_node_locked(params).await
    }

    async fn create_node_locked(&self, params: CreateNodeParams) -> Result<Node, GraphError> {
        let (batch, event, node) = {
            let state = self.read();

            if let Some(system_id) = &params.system_id {
                validate_system_id(system_id)?;
                if state.node_by_system_id(system_id).is_some() {
                    return Err(ValidationError::DuplicateSystemId(system_id.clone()).into());
                }
            }
            let id = params.id.unwrap_or_else(|| Uuid::new_v4().to_string());
            if state.nodes.contains_key(&id) {
                return Err(ValidationError::InvalidDefinition(format!(
                    "node id already exists: {}",
                    id
                ))
                .into());
            }
            if let Some(owner) = &params.owner_id {
                if state.live_node(owner).is_none() {
                    return Err(GraphError::node_not_found(owner));
                }
            }

            let mut node = Node::new_with_id(id, params.content, params.owner_id);
            node.system_id = params.system_id;

            let mut planner = BatchPlanner::new(&state);
            let mut event = MutationEvent::new(MutationEventType::NodeCreated, &node.id)
                .with_timestamp(planner.now)
                .with_system_id(node.system_id.clone());
            node.created_at = planner.now;
            node.updated_at = planner.now;

            if let Some(supertag_ref) = &params.supertag {
                Self::require_builtin(&state, FIELD_SUPERTAG)?;
                let supertag = state
                    .resolve_ref(supertag_ref)
                    .ok_or_else(|| GraphError::not_found("Supertag", supertag_ref))?;
                planner.insert(&node.id, FIELD_SUPERTAG, Value::String(supertag.id.clone()), 0);
                event = event.with_supertag(supertag.reference_key());
            }
            planner.upsert(node.clone());
            (planner.batch, event, node)
        };

        self.commit(batch, vec![event]).await?;
        Ok(node)
    }

    /// Replace a node's content. Unchanged content is a no-op.
    pub async fn update_node_content(
        &self,
        node_id: &str,
        content: impl Into<String>,
    ) -> Result<Node, GraphError> {
        let content = content.into();
        let _gate = self.write_gate.lock().await;

        let (batch, event, updated) = {
            let state = self.read();
            let node = state
                .live_node(node_id)
                .ok_or_else(|| GraphError::node_not_found(node_id))?;
            if node.content.as_deref() == Some(content.as_str()) {
                return Ok(node.clone());
            }

            let mut planner = BatchPlanner::new(&state);
            let mut updated = node.clone();
            updated.set_content(content.clone());
            updated.touch(planner.now);

            let event = MutationEvent::new(MutationEventType::NodeUpdated, node_id)
                .with_timestamp(planner.now)
                .with_system_id(node.system_id.clone())
                .with_values(
                    node.content.clone().map(Value::String),
                    Some(Value::String(content)),
                );
            planner.upsert(updated.clone());
            (planner.batch, event, updated)
        };

        self.commit(batch, vec![event]).await?;
        Ok(updated)
    }

    /// Soft-delete a node. Deleting an already deleted node is a no-op.
    ///
    /// There is no cascade: owned nodes stay live and references to the node
    /// stay stored.
    pub async fn delete_node(&self, node_id: &str) -> Result<(), GraphError> {
        let _gate = self.write_gate.lock().await;

        let (batch, event) = {
            let state = self.read();
            let node = state
                .nodes
                .get(node_id)
                .ok_or_else(|| GraphError::node_not_found(node_id))?;
            if node.is_deleted() {
                return Ok(());
            }

            let mut planner = BatchPlanner::new(&state);
            let mut deleted = node.clone();
            deleted.deleted_at = Some(planner.now);
            deleted.touch(planner.now);

            let event = MutationEvent::new(MutationEventType::NodeDeleted, node_id)
                .with_timestamp(planner.now)
                .with_system_id(node.system_id.clone());
            planner.upsert(deleted);
            (planner.batch, event)
        };

        self.commit(batch, vec![event]).await
    }

    //
    // PROPERTY OPERATIONS
    //

    /// Replace every value of a field with a single value.
    pub async fn set_property(
        &self,
        node_id: &str,
        field_ref: &str,
        value: Value,
    ) -> Result<(), GraphError> {
        let _gate = self.write_gate.lock().await;
        self.require_live(node_id)?;
        let field_id = self.ensure_field_locked(field_ref).await?;

        let (batch, event) = {
            let state = self.read();
            Self::reject_structural_write(&field_id)?;
            let node = state
                .live_node(node_id)
                .ok_or_else(|| GraphError::node_not_found(node_id))?;

            let current = state.values(node_id, &field_id);
            if current.len() == 1 && current[0] == value {
                return Ok(());
            }

            let mut planner = BatchPlanner::new(&state);
            planner.delete_field(node_id, &field_id);
            planner.insert(node_id, &field_id, value.clone(), 0);
            planner.touch(node);

            let event = MutationEvent::new(MutationEventType::PropertySet, node_id)
                .with_timestamp(planner.now)
                .with_system_id(node.system_id.clone())
                .with_field(state.reference_key(&field_id))
                .with_values(state.read_value(node_id, &field_id), Some(value));
            (planner.batch, event)
        };

        self.commit(batch, vec![event]).await
    }

    /// Append a value after the current last value of a field.
    pub async fn add_property_value(
        &self,
        node_id: &str,
        field_ref: &str,
        value: Value,
    ) -> Result<(), GraphError> {
        let _gate = self.write_gate.lock().await;
        self.require_live(node_id)?;
        let field_id = self.ensure_field_locked(field_ref).await?;
        Self::reject_structural_write(&field_id)?;
        self.append_value_locked(node_id, &field_id, value).await
    }

    async fn append_value_locked(
        &self,
        node_id: &str,
        field_id: &str,
        value: Value,
    ) -> Result<(), GraphError> {
        let (batch, event) = {
            let state = self.read();
            let node = state
                .live_node(node_id)
                .ok_or_else(|| GraphError::node_not_found(node_id))?;

            let before = state.read_value(node_id, field_id);
            let order = state.max_order(node_id, field_id).map_or(0, |max| max + 1);
            let after = match &before {
                None => value.clone(),
                Some(Value::Array(values)) if state.values(node_id, field_id).len() > 1 => {
                    let mut values = values.clone();
                    values.push(value.clone());
                    Value::Array(values)
                }
                Some(single) => Value::Array(vec![single.clone(), value.clone()]),
            };

            let mut planner = BatchPlanner::new(&state);
            planner.insert(node_id, field_id, value, order);
            planner.touch(node);

            let event = MutationEvent::new(MutationEventType::PropertyAdded, node_id)
                .with_timestamp(planner.now)
                .with_system_id(node.system_id.clone())
                .with_field(state.reference_key(field_id))
                .with_values(before, Some(after));
            (planner.batch, event)
        };

        self.commit(batch, vec![event]).await
    }

    /// Remove every value of a field. Clearing an absent field is a no-op.
    pub async fn clear_property(&self, node_id: &str, field_ref: &str) -> Result<(), GraphError> {
        let _gate = self.write_gate.lock().await;

        let (batch, event) = {
            let state = self.read();
            let node = state
                .live_node(node_id)
                .ok_or_else(|| GraphError::node_not_found(node_id))?;
            let Some(field) = state.resolve_ref(field_ref) else {
                return Ok(());
            };
            let field_id = field.id.clone();
            Self::reject_structural_write(&field_id)?;

            let before = state.read_value(node_id, &field_id);
            if before.is_none() {
                return Ok(());
            }

            let mut planner = BatchPlanner::new(&state);
            planner.delete_field(node_id, &field_id);
            planner.touch(node);

            let event = MutationEvent::new(MutationEventType::PropertyRemoved, node_id)
                .with_timestamp(planner.now)
                .with_system_id(node.system_id.clone())
                .with_field(state.reference_key(&field_id))
                .with_values(before, None);
            (planner.batch, event)
        };

        self.commit(batch, vec![event]).await
    }

    //
    // SUPERTAG OPERATIONS
    //

    /// Assign a supertag. Assigning an already assigned supertag is a no-op.
    pub async fn add_supertag(&self, node_id: &str, supertag_ref: &str) -> Result<(), GraphError> {
        let _gate = self.write_gate.lock().await;

        let (batch, event) = {
            let state = self.read();
            Self::require_builtin(&state, FIELD_SUPERTAG)?;
            let node = state
                .live_node(node_id)
                .ok_or_else(|| GraphError::node_not_found(node_id))?;
            let supertag = state
                .resolve_ref(supertag_ref)
                .ok_or_else(|| GraphError::not_found("Supertag", supertag_ref))?;

            if state.direct_supertags(node_id).contains(&supertag.id) {
                return Ok(());
            }

            let mut planner = BatchPlanner::new(&state);
            let order = state
                .max_order(node_id, FIELD_SUPERTAG)
                .map_or(0, |max| max + 1);
            planner.insert(node_id, FIELD_SUPERTAG, Value::String(supertag.id.clone()), order);
            planner.touch(node);

            let event = MutationEvent::new(MutationEventType::SupertagAdded, node_id)
                .with_timestamp(planner.now)
                .with_system_id(node.system_id.clone())
                .with_field(FIELD_SUPERTAG)
                .with_supertag(supertag.reference_key());
            (planner.batch, event)
        };

        self.commit(batch, vec![event]).await
    }

    /// Unassign a supertag. Removing an unassigned supertag is a no-op.
    pub async fn remove_supertag(&self, node_id: &str, supertag_ref: &str) -> Result<(), GraphError> {
        let _gate = self.write_gate.lock().await;

        let (batch, event) = {
            let state = self.read();
            let node = state
                .live_node(node_id)
                .ok_or_else(|| GraphError::node_not_found(node_id))?;

            // A deleted supertag can still be unassigned by its node id
            let (supertag_id, supertag_key) = match state.resolve_ref(supertag_ref) {
                Some(supertag) => (supertag.id.clone(), supertag.reference_key().to_string()),
                None => (supertag_ref.to_string(), state.reference_key(supertag_ref)),
            };

            let rows: Vec<i64> = state
                .rows(node_id)
                .iter()
                .filter(|p| {
                    p.field_node_id == FIELD_SUPERTAG && p.value.as_str() == Some(&supertag_id)
                })
                .map(|p| p.id)
                .collect();
            if rows.is_empty() {
                return Ok(());
            }

            let mut planner = BatchPlanner::new(&state);
            for id in rows {
                planner.delete_row(node_id, id);
            }
            planner.touch(node);

            let event = MutationEvent::new(MutationEventType::SupertagRemoved, node_id)
                .with_timestamp(planner.now)
                .with_system_id(node.system_id.clone())
                .with_field(FIELD_SUPERTAG)
                .with_supertag(supertag_key);
            (planner.batch, event)
        };

        self.commit(batch, vec![event]).await
    }

    /// Create a supertag node (tagged `supertag:tag`).
    pub async fn create_supertag(
        &self,
        system_id: &str,
        name: impl Into<String>,
    ) -> Result<Node, GraphError> {
        let _gate = self.write_gate.lock().await;
        self.create_node_locked(
            CreateNodeParams::new(name)
                .with_system_id(system_id)
                .with_supertag(SUPERTAG_TAG),
        )
        .await
    }

    /// Add an `extends` edge: `child` becomes a subtag of `parent`.
    ///
    /// Cycles are stored as given; inheritance resolution tolerates them.
    pub async fn set_extends(&self, child_ref: &str, parent_ref: &str) -> Result<(), GraphError> {
        let _gate = self.write_gate.lock().await;

        let (child_id, parent_id) = {
            let state = self.read();
            Self::require_builtin(&state, FIELD_EXTENDS)?;
            let child = state
                .resolve_ref(child_ref)
                .ok_or_else(|| GraphError::not_found("Supertag", child_ref))?;
            let parent = state
                .resolve_ref(parent_ref)
                .ok_or_else(|| GraphError::not_found("Supertag", parent_ref))?;
            if child.id == parent.id {
                return Err(ValidationError::InvalidDefinition(format!(
                    "supertag {} cannot extend itself",
                    child.reference_key()
                ))
                .into());
            }
            if state.extends_parents(&child.id).contains(&parent.id) {
                return Ok(());
            }
            (child.id.clone(), parent.id.clone())
        };

        self.append_value_locked(&child_id, FIELD_EXTENDS, Value::String(parent_id))
            .await
    }

    //
    // READS
    //

    /// Live node by id. Soft-deleted nodes resolve to `None`.
    pub fn find_node_by_id(&self, node_id: &str) -> Option<Node> {
        self.read().live_node(node_id).cloned()
    }

    pub fn find_node_by_system_id(&self, system_id: &str) -> Option<Node> {
        self.read().node_by_system_id(system_id).cloned()
    }

    /// First value of a field by order.
    pub fn get_property(&self, node_id: &str, field_ref: &str) -> Option<Value> {
        self.get_property_values(node_id, field_ref)
            .into_iter()
            .next()
    }

    pub fn get_property_values(&self, node_id: &str, field_ref: &str) -> Vec<Value> {
        let state = self.read();
        match state.resolve_ref(field_ref) {
            Some(field) => state.values(node_id, &field.id),
            None => Vec::new(),
        }
    }

    pub fn has_field(&self, node_id: &str, field_ref: &str) -> bool {
        !self.get_property_values(node_id, field_ref).is_empty()
    }

    /// Directly assigned supertag node ids, in assignment order.
    pub fn get_supertags(&self, node_id: &str) -> Vec<String> {
        self.read().direct_supertags(node_id)
    }

    /// Live nodes owned by `owner_id`, ordered by id.
    pub fn get_children(&self, owner_id: &str) -> Vec<Node> {
        let state = self.read();
        state
            .owned_by(owner_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.live_node(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live nodes (built-ins included)
    pub fn node_count(&self) -> usize {
        self.read().live.len()
    }

    //
    // HELPERS
    //

    fn require_live(&self, node_id: &str) -> Result<(), GraphError> {
        if self.read().live_node(node_id).is_none() {
            return Err(GraphError::node_not_found(node_id));
        }
        Ok(())
    }

    fn require_builtin(state: &StoreState, system_id: &'static str) -> Result<(), GraphError> {
        if state.live_node(system_id).is_none() {
            return Err(GraphError::not_found("Built-in field", system_id));
        }
        Ok(())
    }

    fn reject_structural_write(field_id: &str) -> Result<(), GraphError> {
        if field_id == FIELD_SUPERTAG {
            return Err(ValidationError::InvalidDefinition(
                "supertag assignments are written with add_supertag/remove_supertag".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Resolve a field reference, materializing a field node when unknown.
    ///
    /// Must be called with the write gate held.
    async fn ensure_field_locked(&self, field_ref: &str) -> Result<String, GraphError> {
        let (batch, event, field_id) = {
            let state = self.read();
            if let Some(field) = state.resolve_ref(field_ref) {
                return Ok(field.id.clone());
            }
            validate_system_id(field_ref)?;

            let mut planner = BatchPlanner::new(&state);
            let mut field = Node::new(Some(field_ref.to_string()), None).with_system_id(field_ref);
            field.created_at = planner.now;
            field.updated_at = planner.now;

            let mut event = MutationEvent::new(MutationEventType::NodeCreated, &field.id)
                .with_timestamp(planner.now)
                .with_system_id(field.system_id.clone());
            if state.live_node(FIELD_SUPERTAG).is_some() && state.live_node(SUPERTAG_FIELD).is_some()
            {
                planner.insert(
                    &field.id,
                    FIELD_SUPERTAG,
                    Value::String(SUPERTAG_FIELD.to_string()),
                    0,
                );
                event = event.with_supertag(SUPERTAG_FIELD);
            }
            let field_id = field.id.clone();
            planner.upsert(field);
            (planner.batch, event, field_id)
        };

        tracing::debug!("Materializing field node for '{}'", field_ref);
        self.commit(batch, vec![event]).await?;
        Ok(field_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryBackend;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    async fn bootstrapped() -> (Arc<NodeStore>, Arc<StdMutex<Vec<MutationEvent>>>) {
        let bus = EventBus::new();
        let store = NodeStore::open(Arc::new(MemoryBackend::new()), bus.clone())
            .await
            .unwrap();
        store.bootstrap().await.unwrap();

        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(None, move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        });
        (store, events)
    }

    fn types(events: &StdMutex<Vec<MutationEvent>>) -> Vec<MutationEventType> {
        events.lock().unwrap().iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let store = NodeStore::open(Arc::new(MemoryBackend::new()), EventBus::new())
            .await
            .unwrap();
        let seeded = store.bootstrap().await.unwrap();
        assert_eq!(seeded, system_nodes().len());
        assert_eq!(store.bootstrap().await.unwrap(), 0);

        let tag = store.find_node_by_system_id(SUPERTAG_TAG).unwrap();
        assert_eq!(tag.id, SUPERTAG_TAG);
        assert_eq!(store.get_supertags(SUPERTAG_TAG), vec![SUPERTAG_TAG.to_string()]);
        assert_eq!(
            store.get_property(FIELD_SUPERTAG, FIELD_FIELD_TYPE),
            Some(json!("reference"))
        );
    }

    #[tokio::test]
    async fn test_set_property_and_read_back() {
        let (store, events) = bootstrapped().await;
        let node = store.create_node(CreateNodeParams::new("A")).await.unwrap();

        store
            .set_property(&node.id, "field:status", json!("open"))
            .await
            .unwrap();
        assert_eq!(store.get_property(&node.id, "field:status"), Some(json!("open")));
        assert!(store.has_field(&node.id, "field:status"));

        // created, lazy field created, property set
        assert_eq!(
            types(&events),
            vec![
                MutationEventType::NodeCreated,
                MutationEventType::NodeCreated,
                MutationEventType::PropertySet
            ]
        );
        let field = store.find_node_by_system_id("field:status").unwrap();
        assert_eq!(store.get_supertags(&field.id), vec![SUPERTAG_FIELD.to_string()]);
    }

    #[tokio::test]
    async fn test_set_same_value_is_noop() {
        let (store, events) = bootstrapped().await;
        let node = store.create_node(CreateNodeParams::new("A")).await.unwrap();
        store.set_property(&node.id, "field:n", json!(1)).await.unwrap();
        let before = events.lock().unwrap().len();

        store.set_property(&node.id, "field:n", json!(1)).await.unwrap();
        assert_eq!(events.lock().unwrap().len(), before);
        assert_eq!(store.find_node_by_id(&node.id).unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_property_event_payloads() {
        let (store, events) = bootstrapped().await;
        let node = store.create_node(CreateNodeParams::new("A")).await.unwrap();
        store.set_property(&node.id, "field:status", json!("pending")).await.unwrap();
        store.set_property(&node.id, "field:status", json!("done")).await.unwrap();
        store.add_property_value(&node.id, "field:status", json!("x")).await.unwrap();
        store.clear_property(&node.id, "field:status").await.unwrap();

        let events = events.lock().unwrap();
        let set = &events[events.len() - 3];
        assert_eq!(set.event_type, MutationEventType::PropertySet);
        assert_eq!(set.field_system_id.as_deref(), Some("field:status"));
        assert_eq!(set.before_value, Some(json!("pending")));
        assert_eq!(set.after_value, Some(json!("done")));

        let added = &events[events.len() - 2];
        assert_eq!(added.after_value, Some(json!(["done", "x"])));

        let removed = events.last().unwrap();
        assert_eq!(removed.event_type, MutationEventType::PropertyRemoved);
        assert_eq!(removed.before_value, Some(json!(["done", "x"])));
        assert!(removed.after_value.is_none());
    }

    #[tokio::test]
    async fn test_add_value_appends_in_order() {
        let (store, _) = bootstrapped().await;
        let node = store.create_node(CreateNodeParams::new("A")).await.unwrap();
        for v in ["a", "b", "c"] {
            store.add_property_value(&node.id, "field:tags", json!(v)).await.unwrap();
        }
        assert_eq!(
            store.get_property_values(&node.id, "field:tags"),
            vec![json!("a"), json!("b"), json!("c")]
        );
    }

    #[tokio::test]
    async fn test_clear_then_has_field_false() {
        let (store, events) = bootstrapped().await;
        let node = store.create_node(CreateNodeParams::new("A")).await.unwrap();
        store.set_property(&node.id, "field:x", json!(true)).await.unwrap();
        store.clear_property(&node.id, "field:x").await.unwrap();
        assert!(!store.has_field(&node.id, "field:x"));

        let count = events.lock().unwrap().len();
        store.clear_property(&node.id, "field:x").await.unwrap();
        store.clear_property(&node.id, "field:never").await.unwrap();
        assert_eq!(events.lock().unwrap().len(), count);
        assert!(store.find_node_by_system_id("field:never").is_none());
    }

    #[tokio::test]
    async fn test_supertag_assignment_is_idempotent() {
        let (store, events) = bootstrapped().await;
        store.create_supertag("supertag:task", "Task").await.unwrap();
        let node = store.create_node(CreateNodeParams::new("A")).await.unwrap();

        store.add_supertag(&node.id, "supertag:task").await.unwrap();
        store.add_supertag(&node.id, "supertag:task").await.unwrap();
        let added: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == MutationEventType::SupertagAdded)
            .cloned()
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].supertag_system_id.as_deref(), Some("supertag:task"));
        assert_eq!(added[0].field_system_id.as_deref(), Some(FIELD_SUPERTAG));

        store.remove_supertag(&node.id, "supertag:task").await.unwrap();
        store.remove_supertag(&node.id, "supertag:task").await.unwrap();
        assert!(store.get_supertags(&node.id).is_empty());
        assert_eq!(
            types(&events)
                .iter()
                .filter(|t| **t == MutationEventType::SupertagRemoved)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_supertag_is_not_found() {
        let (store, _) = bootstrapped().await;
        let err = store
            .create_node(CreateNodeParams::new("A").with_supertag("supertag:missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_soft_delete_releases_system_id() {
        let (store, events) = bootstrapped().await;
        let first = store.create_supertag("supertag:project", "Project").await.unwrap();
        assert!(matches!(
            store.create_supertag("supertag:project", "Again").await,
            Err(GraphError::Validation(ValidationError::DuplicateSystemId(_)))
        ));

        store.delete_node(&first.id).await.unwrap();
        store.delete_node(&first.id).await.unwrap();
        assert!(store.find_node_by_id(&first.id).is_none());
        assert_eq!(
            types(&events)
                .iter()
                .filter(|t| **t == MutationEventType::NodeDeleted)
                .count(),
            1
        );

        let second = store.create_supertag("supertag:project", "Project").await.unwrap();
        assert_eq!(store.find_node_by_system_id("supertag:project").unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_update_content_event() {
        let (store, events) = bootstrapped().await;
        let node = store.create_node(CreateNodeParams::new("Draft")).await.unwrap();
        let updated = store.update_node_content(&node.id, "Final **copy**").await.unwrap();
        assert_eq!(updated.content_plain.as_deref(), Some("final copy"));
        store.update_node_content(&node.id, "Final **copy**").await.unwrap();

        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, MutationEventType::NodeUpdated);
        assert_eq!(last.before_value, Some(json!("Draft")));
        assert_eq!(last.after_value, Some(json!("Final **copy**")));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_children_and_dangling_owner() {
        let (store, _) = bootstrapped().await;
        let parent = store.create_node(CreateNodeParams::new("P")).await.unwrap();
        let child = store
            .create_node(CreateNodeParams::new("C").with_owner(&parent.id))
            .await
            .unwrap();
        assert_eq!(store.get_children(&parent.id)[0].id, child.id);

        store.delete_node(&parent.id).await.unwrap();
        let child = store.find_node_by_id(&child.id).unwrap();
        assert_eq!(child.owner_id.as_deref(), Some(parent.id.as_str()));
        assert!(store.find_node_by_id(&parent.id).is_none());
    }

    #[tokio::test]
    async fn test_supertag_field_is_not_writable_as_property() {
        let (store, _) = bootstrapped().await;
        let node = store.create_node(CreateNodeParams::new("A")).await.unwrap();
        let err = store
            .set_property(&node.id, FIELD_SUPERTAG, json!(SUPERTAG_TAG))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[tokio::test]
    async fn test_set_extends() {
        let (store, events) = bootstrapped().await;
        store.create_supertag("supertag:task", "Task").await.unwrap();
        store.create_supertag("supertag:bug", "Bug").await.unwrap();
        let bug = store.find_node_by_system_id("supertag:bug").unwrap();

        store.set_extends("supertag:bug", "supertag:task").await.unwrap();
        store.set_extends("supertag:bug", "supertag:task").await.unwrap();
        let task = store.find_node_by_system_id("supertag:task").unwrap();
        assert_eq!(store.get_property_values(&bug.id, FIELD_EXTENDS), vec![json!(task.id)]);

        let last = events.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.event_type, MutationEventType::PropertyAdded);
        assert_eq!(last.field_system_id.as_deref(), Some(FIELD_EXTENDS));
        assert!(store.set_extends("supertag:bug", "supertag:bug").await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_restores_working_set() {
        let backend = MemoryBackend::new();
        let store = NodeStore::open(Arc::new(backend.clone()), EventBus::new())
            .await
            .unwrap();
        store.bootstrap().await.unwrap();
        let node = store.create_node(CreateNodeParams::new("Keep")).await.unwrap();
        store.set_property(&node.id, "field:n", json!(3)).await.unwrap();

        let reopened = NodeStore::open(Arc::new(backend), EventBus::new())
            .await
            .unwrap();
        assert_eq!(reopened.get_property(&node.id, "field:n"), Some(json!(3)));
        assert_eq!(reopened.node_count(), store.node_count());
        reopened.add_property_value(&node.id, "field:n", json!(4)).await.unwrap();
        assert_eq!(reopened.get_property_values(&node.id, "field:n").len(), 2);
    }
}
