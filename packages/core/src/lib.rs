//! Semantic Graph Core
//!
//! This crate provides an embedded, single-process graph store for
//! self-describing nodes, together with a live query layer that keeps query
//! results, aggregates, and automation rules up to date as mutations land.
//!
//! # Architecture
//!
//! - **Schema-as-Node**: fields and supertags are ordinary nodes with system ids
//! - **Two tables**: `nodes` and `node_properties` (libsql), plus automation state
//! - **In-memory working set**: queries evaluate against indexed tables in memory
//! - **Single writer**: every mutation passes through the store's write gate
//!
//! # Modules
//!
//! - [`models`] - Data structures (Node, Property, AssembledNode, built-ins)
//! - [`db`] - Node store, storage backends, mutation events and the event bus
//! - [`services`] - Inheritance, queries, subscriptions, computed fields, automations
//! - [`config`] - Runtime configuration
//! - [`logging`] - tracing subscriber setup for binaries
//! - [`utils`] - Content normalization helpers

pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::GraphConfig;
pub use db::{EventBus, MutationEvent, MutationEventType, NodeStore};
pub use models::*;
pub use services::*;
