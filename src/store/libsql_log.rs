//! libSQL backend — async `SnapshotLog` implementation.
//!
//! Stores one JSON record per row in an append-only table. Supports local
//! file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::store::traits::SnapshotLog;

/// libSQL-backed append-only log.
///
/// A single connection is reused for all operations; `libsql::Connection`
/// is safe for concurrent async use.
pub struct LibSqlLog {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlLog {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PersistenceError::Log(format!("Failed to create log directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| PersistenceError::Log(format!("Failed to open log database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| PersistenceError::Log(format!("Failed to create connection: {e}")))?;

        let log = Self {
            db: Arc::new(db),
            conn,
        };
        log.init_schema().await?;
        info!(path = %path.display(), "Snapshot log opened");
        Ok(log)
    }

    /// Create an in-memory log (for tests).
    pub async fn new_memory() -> Result<Self, PersistenceError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| PersistenceError::Log(format!("Failed to create in-memory log: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| PersistenceError::Log(format!("Failed to create connection: {e}")))?;

        let log = Self {
            db: Arc::new(db),
            conn,
        };
        log.init_schema().await?;
        Ok(log)
    }

    async fn init_schema(&self) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    record TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
                (),
            )
            .await
            .map_err(|e| PersistenceError::Log(format!("Failed to initialize schema: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotLog for LibSqlLog {
    async fn append(&self, record: serde_json::Value) -> Result<(), PersistenceError> {
        let text = serde_json::to_string(&record)?;
        self.conn
            .execute(
                "INSERT INTO entries (record, created_at) VALUES (?1, ?2)",
                params![text, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| PersistenceError::Log(format!("Failed to append record: {e}")))?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<serde_json::Value>, PersistenceError> {
        let mut rows = self
            .conn
            .query("SELECT record FROM entries ORDER BY id ASC", ())
            .await
            .map_err(|e| PersistenceError::Log(format!("Failed to read records: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| PersistenceError::Log(format!("Failed to read row: {e}")))?
        {
            let text: String = row
                .get(0)
                .map_err(|e| PersistenceError::Log(format!("Failed to read column: {e}")))?;
            match serde_json::from_str(&text) {
                Ok(value) => records.push(value),
                Err(e) => warn!(error = %e, "Skipping unreadable log record"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_read_back_in_order() {
        let log = LibSqlLog::new_memory().await.unwrap();

        log.append(serde_json::json!({"n": 1})).await.unwrap();
        log.append(serde_json::json!({"n": 2})).await.unwrap();

        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["n"], 1);
        assert_eq!(records[1]["n"], 2);
    }

    #[tokio::test]
    async fn empty_log_reads_empty() {
        let log = LibSqlLog::new_memory().await.unwrap();
        assert!(log.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");

        {
            let log = LibSqlLog::new_local(&path).await.unwrap();
            log.append(serde_json::json!({"kind": "x"})).await.unwrap();
        }

        let log = LibSqlLog::new_local(&path).await.unwrap();
        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["kind"], "x");
    }
}
