//! Service Layer Error Types
//!
//! This module defines the error type returned by store writes and every
//! service operation, providing detailed error handling for business logic
//! failures.

use crate::db::DatabaseError;
use crate::models::ValidationError;
use thiserror::Error;

/// Graph operation errors
///
/// Provides high-level error types for all store and service operations,
/// with detailed context and proper error chaining.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Malformed input: query, definition, or write parameters
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Referenced entity does not exist (or is soft-deleted)
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation on a subscription handle that was already unsubscribed
    #[error("Subscription {id} is no longer active")]
    StaleSubscription { id: String },

    /// Storage backend failure
    #[error("Database operation failed: {0}")]
    Database(#[from] DatabaseError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An automation action could not be carried out
    #[error("Action failed: {context}")]
    ActionFailed { context: String },
}

impl GraphError {
    /// Create a node not found error
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Node",
            id: id.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn stale_subscription(id: impl Into<String>) -> Self {
        Self::StaleSubscription { id: id.into() }
    }

    pub fn action_failed(context: impl Into<String>) -> Self {
        Self::ActionFailed {
            context: context.into(),
        }
    }

    /// Create a validation error from a message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(ValidationError::InvalidDefinition(msg.into()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
