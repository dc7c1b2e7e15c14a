//! Worker instance model.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::definition::WorkerDef;

/// Status of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// A subprocess activation is in flight.
    Running,
    /// Last activation exited with code 0.
    Done,
    /// Last activation failed to launch or exited nonzero.
    Error,
}

impl WorkerStatus {
    /// Check whether the instance is mid-activation.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Registry key of a worker instance: lowercased type name plus numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    type_name: String,
    id: u32,
}

impl InstanceKey {
    /// Build a key; the type name is lowercased so lookups are
    /// case-insensitive.
    pub fn new(type_name: &str, id: u32) -> Self {
        Self {
            type_name: type_name.to_lowercase(),
            id,
        }
    }

    /// The lowercased type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The per-type numeric id.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name, self.id)
    }
}

/// Handle to a live activation, held only while the instance is running.
///
/// Dropping the handle does not touch the subprocess; termination is always
/// an explicit, cooperative request.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    term: CancellationToken,
}

impl ProcessHandle {
    /// Wrap an activation's termination token.
    pub fn new(term: CancellationToken) -> Self {
        Self { term }
    }

    /// Request termination of the live subprocess.
    pub fn terminate(&self) {
        self.term.cancel();
    }
}

/// One activation lineage of a spawned worker, capable of multiple turns.
#[derive(Debug, Clone)]
pub struct WorkerInstance {
    /// Unique within the type, allocated monotonically from 1.
    pub id: u32,
    /// The worker type this instance was spawned from.
    pub def: Arc<WorkerDef>,
    /// Current lifecycle status.
    pub status: WorkerStatus,
    /// Prompt text of the current turn.
    pub task: String,
    /// Ordered output fragments of the current turn.
    pub output_chunks: Vec<String>,
    /// Tool-start events observed across all turns.
    pub tool_invocations: u32,
    /// Wall-clock duration of the current/most recent activation.
    pub elapsed_ms: u64,
    /// Transcript path handed to the subprocess for conversational memory.
    pub session_file: PathBuf,
    /// 1 on creation, +1 per continuation.
    pub turn_count: u32,
    /// Present only while a live subprocess backs this instance.
    pub process: Option<ProcessHandle>,
}

impl WorkerInstance {
    /// Registry key of this instance.
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.def.name, self.id)
    }

    /// Concatenated output of the current turn.
    pub fn output(&self) -> String {
        self.output_chunks.concat()
    }

    /// Human-oriented completion summary for a finished turn.
    pub fn summary(&self, result: &str) -> String {
        let turn = if self.turn_count > 1 {
            format!(" (Turn {})", self.turn_count)
        } else {
            String::new()
        };
        format!(
            "{} #{}{} finished in {}s.\n\nResult:\n{}",
            self.def.name,
            self.id,
            turn,
            self.elapsed_ms / 1000,
            result
        )
    }
}

/// Derive a fresh session-file path for a new instance.
///
/// The name folds in the type, id, creation time, and a short random
/// disambiguator so rapid repeated spawns never collide.
pub fn session_file_path(dir: &Path, type_name: &str, id: u32) -> PathBuf {
    let slug = type_name
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    let stamp = Utc::now().timestamp_millis();
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    dir.join(format!("{slug}-{id}-{stamp}-{nonce}.jsonl"))
}
