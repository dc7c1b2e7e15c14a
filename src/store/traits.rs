//! Backend-agnostic append-only log trait.

use async_trait::async_trait;

use crate::error::PersistenceError;

/// Durable, ordered, append-only record log.
///
/// The persistence gateway appends snapshot records and scans the full
/// history at startup; backends never interpret the records themselves.
#[async_trait]
pub trait SnapshotLog: Send + Sync {
    /// Append one record to the end of the log.
    async fn append(&self, record: serde_json::Value) -> Result<(), PersistenceError>;

    /// All records, oldest first.
    async fn read_all(&self) -> Result<Vec<serde_json::Value>, PersistenceError>;
}
