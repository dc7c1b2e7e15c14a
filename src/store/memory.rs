//! In-memory log for tests.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::PersistenceError;
use crate::store::traits::SnapshotLog;

/// Vec-backed `SnapshotLog`; nothing survives the process.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<serde_json::Value>>,
}

impl MemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log pre-seeded with records (restore tests).
    pub fn with_records(records: impl IntoIterator<Item = serde_json::Value>) -> Self {
        Self {
            entries: Mutex::new(records.into_iter().collect()),
        }
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl SnapshotLog for MemoryLog {
    async fn append(&self, record: serde_json::Value) -> Result<(), PersistenceError> {
        self.entries.lock().await.push(record);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<serde_json::Value>, PersistenceError> {
        Ok(self.entries.lock().await.clone())
    }
}
