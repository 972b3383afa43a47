//! Database Error Types
//!
//! Failures of a storage backend while opening, loading or committing rows.

use std::path::PathBuf;
use thiserror::Error;

/// Storage backend errors
///
/// Service-level code wraps these in [`GraphError::Database`].
///
/// [`GraphError::Database`]: crate::services::GraphError::Database
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to open database at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        source: libsql::Error,
    },

    #[error("Failed to initialize schema: {0}")]
    SchemaInitFailed(String),

    #[error("Failed to create parent directory for database: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    #[error("libsql error: {0}")]
    Libsql(#[from] libsql::Error),

    /// A statement failed; `context` names the operation
    #[error("Statement failed: {context}")]
    Statement { context: String },

    /// A batch broke a table constraint and was rejected as a whole
    #[error("Constraint violated in {table}: {reason}")]
    ConstraintViolation { table: &'static str, reason: String },

    /// A stored row could not be decoded
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("Failed to encode JSON column: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl DatabaseError {
    pub fn connection_failed(path: PathBuf, source: libsql::Error) -> Self {
        Self::ConnectionFailed { path, source }
    }

    pub fn schema_init(msg: impl Into<String>) -> Self {
        Self::SchemaInitFailed(msg.into())
    }

    pub fn statement(context: impl Into<String>) -> Self {
        Self::Statement {
            context: context.into(),
        }
    }

    pub fn constraint(table: &'static str, reason: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            table,
            reason: reason.into(),
        }
    }

    pub fn corrupt_row(table: &'static str, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            table,
            reason: reason.into(),
        }
    }
}
