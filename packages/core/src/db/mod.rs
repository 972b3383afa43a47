//! Database Layer
//!
//! This module handles persistence and change notification for the graph:
//!
//! - `NodeStore` - node/property/supertag writes, indexed in-memory reads
//! - `StorageBackend` - durable row storage (libsql or in-memory)
//! - `EventBus` - synchronous dispatch of `MutationEvent`s after every write
//!
//! # Architecture
//!
//! The store keeps the full working set in memory and treats the backend as
//! the durable log of record: a write is committed to the backend first, then
//! applied to the working set, then announced on the bus. Everything above
//! this layer (queries, subscriptions, computed fields, automations) reads the
//! working set and reacts to bus events.

mod backend;
mod error;
mod event_bus;
pub mod events;
mod node_store;
mod tables;
mod turso_backend;

pub use backend::{MemoryBackend, StorageBackend, StoredRows, WriteBatch, WriteOp};
pub use error::DatabaseError;
pub use event_bus::{EventBus, EventSubscription, ListenerId};
pub use events::{EventFilter, MutationEvent, MutationEventType};
pub use node_store::NodeStore;
pub(crate) use tables::StoreState;
pub use turso_backend::TursoBackend;
