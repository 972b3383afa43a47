//! libsql storage backend
//!
//! Persists the logical schema in a local libsql (SQLite-compatible) file.
//!
//! # Schema
//!
//! - `nodes` - one row per node, soft-deleted rows included
//! - `node_properties` - ordered property values as JSON text
//! - `automation_state` - per-automation trigger state as JSON text
//!
//! # SQLite Configuration
//!
//! - WAL mode: Write-Ahead Logging for better concurrency
//! - Busy timeout: 5 seconds instead of failing immediately on lock
//! - Foreign keys: Enabled for referential integrity
//!
//! A single connection is held behind an async mutex. Store writes are already
//! serialized by the store's write gate, and `:memory:` databases are private
//! to the connection that opened them.

use super::backend::{StorageBackend, StoredRows, WriteBatch, WriteOp};
use super::error::DatabaseError;
use crate::models::{Node, Property};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const NODE_COLUMNS: &str =
    "id, content, content_plain, system_id, owner_id, version, created_at, updated_at, deleted_at";

const PROPERTY_COLUMNS: &str = "id, node_id, field_node_id, value, \"order\", created_at, updated_at";

/// libsql-backed [`StorageBackend`]
pub struct TursoBackend {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    // Keeps the database handle alive for the connection's lifetime
    _db: libsql::Database,
}

impl TursoBackend {
    /// Open (or create) a database file and initialize the schema.
    ///
    /// This will:
    /// 1. Ensure the parent directory exists
    /// 2. Open/create the database file
    /// 3. Apply connection pragmas
    /// 4. Create tables and indexes (idempotent)
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;
        let conn = db.connect()?;

        let backend = Self {
            conn: Mutex::new(conn),
            db_path,
            _db: db,
        };
        backend.initialize_schema().await?;

        tracing::info!("Opened libsql store at {}", backend.db_path.display());
        Ok(backend)
    }

    /// Open a private in-memory database (used by tests).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::open(":memory:").await
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Execute a PRAGMA statement
    ///
    /// PRAGMA statements return rows, so they go through query() instead of
    /// execute().
    async fn execute_pragma(conn: &Connection, pragma: &str) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::statement(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::statement(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;

        Self::execute_pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        Self::execute_pragma(&conn, "PRAGMA busy_timeout = 5000").await?;
        Self::execute_pragma(&conn, "PRAGMA foreign_keys = ON").await?;

        let statements = [
            (
                "nodes table",
                "CREATE TABLE IF NOT EXISTS nodes (
                    id TEXT PRIMARY KEY,
                    content TEXT,
                    content_plain TEXT,
                    system_id TEXT,
                    owner_id TEXT,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                )",
            ),
            (
                "node_properties table",
                "CREATE TABLE IF NOT EXISTS node_properties (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    node_id TEXT NOT NULL,
                    field_node_id TEXT NOT NULL,
                    value TEXT NOT NULL,
                    \"order\" INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    FOREIGN KEY (node_id) REFERENCES nodes(id),
                    FOREIGN KEY (field_node_id) REFERENCES nodes(id)
                )",
            ),
            (
                "automation_state table",
                "CREATE TABLE IF NOT EXISTS automation_state (
                    automation_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            ),
            // System ids are unique among live nodes only; soft delete releases them
            (
                "index 'idx_nodes_system_id'",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_system_id
                    ON nodes(system_id) WHERE deleted_at IS NULL AND system_id IS NOT NULL",
            ),
            (
                "index 'idx_nodes_owner'",
                "CREATE INDEX IF NOT EXISTS idx_nodes_owner ON nodes(owner_id)",
            ),
            (
                "index 'idx_nodes_content_plain'",
                "CREATE INDEX IF NOT EXISTS idx_nodes_content_plain ON nodes(content_plain)",
            ),
            (
                "index 'idx_nodes_deleted'",
                "CREATE INDEX IF NOT EXISTS idx_nodes_deleted ON nodes(deleted_at)",
            ),
            (
                "index 'idx_properties_node'",
                "CREATE INDEX IF NOT EXISTS idx_properties_node ON node_properties(node_id)",
            ),
            (
                "index 'idx_properties_field'",
                "CREATE INDEX IF NOT EXISTS idx_properties_field ON node_properties(field_node_id)",
            ),
            (
                "index 'idx_properties_value'",
                "CREATE INDEX IF NOT EXISTS idx_properties_value ON node_properties(value)",
            ),
        ];

        for (what, sql) in statements {
            conn.execute(sql, ()).await.map_err(|e| {
                DatabaseError::schema_init(format!("Failed to create {}: {}", what, e))
            })?;
        }
        Ok(())
    }

    /// Parse a stored timestamp
    ///
    /// Rows are written as RFC3339; SQLite's `CURRENT_TIMESTAMP` format is
    /// accepted for hand-edited databases.
    fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Ok(naive.and_utc());
        }
        Err(format!(
            "Unable to parse timestamp '{}' as RFC3339 or SQLite format",
            s
        ))
    }

    fn format_timestamp(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// Convert a `nodes` row (selected with `NODE_COLUMNS`) to a [`Node`]
    fn row_to_node(row: &Row) -> Result<Node, DatabaseError> {
        let corrupt = |e: String| DatabaseError::corrupt_row("nodes", e);

        let id: String = row.get(0)?;
        let content: Option<String> = row.get(1)?;
        let content_plain: Option<String> = row.get(2)?;
        let system_id: Option<String> = row.get(3)?;
        let owner_id: Option<String> = row.get(4)?;
        let version: i64 = row.get(5)?;
        let created_at: String = row.get(6)?;
        let updated_at: String = row.get(7)?;
        let deleted_at: Option<String> = row.get(8)?;

        Ok(Node {
            created_at: Self::parse_timestamp(&created_at).map_err(corrupt)?,
            updated_at: Self::parse_timestamp(&updated_at).map_err(corrupt)?,
            deleted_at: deleted_at
                .as_deref()
                .map(Self::parse_timestamp)
                .transpose()
                .map_err(corrupt)?,
            id,
            content,
            content_plain,
            system_id,
            owner_id,
            version,
        })
    }

    /// Convert a `node_properties` row (selected with `PROPERTY_COLUMNS`)
    fn row_to_property(row: &Row) -> Result<Property, DatabaseError> {
        let corrupt = |e: String| DatabaseError::corrupt_row("node_properties", e);

        let id: i64 = row.get(0)?;
        let node_id: String = row.get(1)?;
        let field_node_id: String = row.get(2)?;
        let value_json: String = row.get(3)?;
        let order: i64 = row.get(4)?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;

        let value: Value = serde_json::from_str(&value_json)
            .map_err(|e| corrupt(format!("property {} value: {}", id, e)))?;

        Ok(Property {
            id,
            node_id,
            field_node_id,
            value,
            order,
            created_at: Self::parse_timestamp(&created_at).map_err(corrupt)?,
            updated_at: Self::parse_timestamp(&updated_at).map_err(corrupt)?,
        })
    }

    async fn apply_op(conn: &Connection, op: &WriteOp) -> Result<(), DatabaseError> {
        match op {
            WriteOp::UpsertNode(node) => {
                conn.execute(
                    "INSERT INTO nodes (id, content, content_plain, system_id, owner_id, version, created_at, updated_at, deleted_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        content = excluded.content,
                        content_plain = excluded.content_plain,
                        system_id = excluded.system_id,
                        owner_id = excluded.owner_id,
                        version = excluded.version,
                        updated_at = excluded.updated_at,
                        deleted_at = excluded.deleted_at",
                    (
                        node.id.as_str(),
                        node.content.as_deref(),
                        node.content_plain.as_deref(),
                        node.system_id.as_deref(),
                        node.owner_id.as_deref(),
                        node.version,
                        Self::format_timestamp(&node.created_at),
                        Self::format_timestamp(&node.updated_at),
                        node.deleted_at.as_ref().map(Self::format_timestamp),
                    ),
                )
                .await
                .map_err(|e| {
                    DatabaseError::statement(format!("Failed to upsert node {}: {}", node.id, e))
                })?;
            }
            WriteOp::InsertProperty(property) => {
                let value_json = serde_json::to_string(&property.value)?;
                conn.execute(
                    "INSERT INTO node_properties (id, node_id, field_node_id, value, \"order\", created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    (
                        property.id,
                        property.node_id.as_str(),
                        property.field_node_id.as_str(),
                        value_json,
                        property.order,
                        Self::format_timestamp(&property.created_at),
                        Self::format_timestamp(&property.updated_at),
                    ),
                )
                .await
                .map_err(|e| {
                    DatabaseError::statement(format!(
                        "Failed to insert property on {}: {}",
                        property.node_id, e
                    ))
                })?;
            }
            WriteOp::DeleteProperties {
                node_id,
                field_node_id,
            } => {
                conn.execute(
                    "DELETE FROM node_properties WHERE node_id = ? AND field_node_id = ?",
                    (node_id.as_str(), field_node_id.as_str()),
                )
                .await
                .map_err(|e| {
                    DatabaseError::statement(format!(
                        "Failed to delete properties on {}: {}",
                        node_id, e
                    ))
                })?;
            }
            WriteOp::DeleteProperty { property_id, .. } => {
                conn.execute(
                    "DELETE FROM node_properties WHERE id = ?",
                    [*property_id],
                )
                .await
                .map_err(|e| {
                    DatabaseError::statement(format!(
                        "Failed to delete property {}: {}",
                        property_id, e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for TursoBackend {
    async fn load(&self) -> Result<StoredRows, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut stored = StoredRows::default();

        let mut rows = conn
            .query(&format!("SELECT {} FROM nodes ORDER BY id", NODE_COLUMNS), ())
            .await
            .map_err(|e| DatabaseError::statement(format!("Failed to load nodes: {}", e)))?;
        while let Some(row) = rows.next().await? {
            stored.nodes.push(Self::row_to_node(&row)?);
        }

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM node_properties ORDER BY node_id, field_node_id, \"order\", id",
                    PROPERTY_COLUMNS
                ),
                (),
            )
            .await
            .map_err(|e| {
                DatabaseError::statement(format!("Failed to load properties: {}", e))
            })?;
        while let Some(row) = rows.next().await? {
            stored.properties.push(Self::row_to_property(&row)?);
        }

        tracing::debug!(
            "Loaded {} nodes and {} properties from {}",
            stored.nodes.len(),
            stored.properties.len(),
            self.db_path.display()
        );
        Ok(stored)
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), DatabaseError> {
        if batch.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().await;

        conn.execute("BEGIN TRANSACTION", ()).await.map_err(|e| {
            DatabaseError::statement(format!("Failed to begin transaction: {}", e))
        })?;

        for op in batch.ordered() {
            if let Err(e) = Self::apply_op(&conn, op).await {
                let _rollback = conn.execute("ROLLBACK", ()).await;
                return Err(e);
            }
        }

        if let Err(e) = conn.execute("COMMIT", ()).await {
            let _rollback = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::statement(format!(
                "Failed to commit transaction: {}",
                e
            )));
        }
        Ok(())
    }

    async fn load_automation_state(
        &self,
        automation_id: &str,
    ) -> Result<Option<Value>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT state FROM automation_state WHERE automation_id = ?",
                [automation_id],
            )
            .await
            .map_err(|e| {
                DatabaseError::statement(format!("Failed to load automation state: {}", e))
            })?;

        match rows.next().await? {
            Some(row) => {
                let json: String = row.get(0)?;
                let state = serde_json::from_str(&json).map_err(|e| {
                    DatabaseError::corrupt_row("automation_state", format!("{}: {}", automation_id, e))
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save_automation_state(
        &self,
        automation_id: &str,
        state: &Value,
    ) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO automation_state (automation_id, state, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(automation_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            (automation_id, json, Self::format_timestamp(&Utc::now())),
        )
        .await
        .map_err(|e| {
            DatabaseError::statement(format!("Failed to save automation state: {}", e))
        })?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        if self.db_path.as_os_str() != ":memory:" {
            Self::execute_pragma(&conn, "PRAGMA wal_checkpoint(TRUNCATE)").await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "libsql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = TursoBackend::parse_timestamp("2025-01-03T10:00:00.000001Z").unwrap();
        let sqlite = TursoBackend::parse_timestamp("2025-01-03 10:00:00").unwrap();
        assert_eq!(rfc.date_naive(), sqlite.date_naive());
        assert!(TursoBackend::parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_timestamp_round_trip_is_exact() {
        let now = Utc::now();
        let parsed = TursoBackend::parse_timestamp(&TursoBackend::format_timestamp(&now)).unwrap();
        assert_eq!(parsed, now);
    }
}
