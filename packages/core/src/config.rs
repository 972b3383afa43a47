//! Runtime configuration
//!
//! `GraphConfig` controls where the graph is stored and how the live query
//! layer behaves. Every field has a default, so a partial JSON document or an
//! environment with none of the variables set yields a working in-memory
//! graph.
//!
//! # Environment Variables
//!
//! - `SEMGRAPH_DB_PATH`: libsql database file (default: in-memory backend)
//! - `SEMGRAPH_SMART_INVALIDATION`: `true`/`false` (default: true)
//! - `SEMGRAPH_DEBOUNCE_MS`: subscription batching window (default: 10)
//! - `SEMGRAPH_ACTION_QUEUE_CAPACITY`: bounded action queue size (default: 1024)

use crate::services::automation::DEFAULT_ACTION_QUEUE_CAPACITY;
use crate::services::error::GraphError;
use crate::services::subscription_service::DEFAULT_DEBOUNCE_MS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_DB_PATH: &str = "SEMGRAPH_DB_PATH";
pub const ENV_SMART_INVALIDATION: &str = "SEMGRAPH_SMART_INVALIDATION";
pub const ENV_DEBOUNCE_MS: &str = "SEMGRAPH_DEBOUNCE_MS";
pub const ENV_ACTION_QUEUE_CAPACITY: &str = "SEMGRAPH_ACTION_QUEUE_CAPACITY";

/// Configuration of a [`GraphContext`](crate::services::GraphContext)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphConfig {
    /// libsql database file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Skip re-evaluating subscriptions an event cannot affect (default: true)
    pub smart_invalidation: bool,
    /// Batching window for subscription re-evaluation; 0 evaluates per mutation
    pub debounce_ms: u64,
    /// Maximum queued automation jobs (default: 1024)
    pub action_queue_capacity: usize,
    /// Drain the action queue on a background task (default: true)
    pub spawn_action_worker: bool,
    /// Seed built-in fields and supertags on open (default: true)
    pub bootstrap: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            smart_invalidation: true,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            action_queue_capacity: DEFAULT_ACTION_QUEUE_CAPACITY,
            spawn_action_worker: true,
            bootstrap: true,
        }
    }
}

impl GraphConfig {
    /// In-memory graph with defaults
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Graph persisted to a libsql file
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Defaults overridden by `SEMGRAPH_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidConfig` for unparsable values.
    pub fn from_env() -> Result<Self, GraphError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GraphError> {
        let mut config = Self::default();
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup(ENV_SMART_INVALIDATION) {
            config.smart_invalidation = parse_var(ENV_SMART_INVALIDATION, &value)?;
        }
        if let Some(value) = lookup(ENV_DEBOUNCE_MS) {
            config.debounce_ms = parse_var(ENV_DEBOUNCE_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_ACTION_QUEUE_CAPACITY) {
            config.action_queue_capacity = parse_var(ENV_ACTION_QUEUE_CAPACITY, &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if self.action_queue_capacity == 0 {
            return Err(GraphError::InvalidConfig(
                "actionQueueCapacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, GraphError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| GraphError::InvalidConfig(format!("{}={:?}: {}", key, value, e)))
}
