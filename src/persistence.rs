//! Debounced snapshot persistence and restore.
//!
//! The registry is projected into a strictly-serializable snapshot and
//! appended to the durable log. Saves are debounced so a burst of mutations
//! (a parallel batch, a stream of deltas) coalesces into one write, and a
//! write is skipped entirely when it would repeat the last one.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::instance::{WorkerInstance, WorkerStatus};
use crate::registry::Registry;
use crate::store::SnapshotLog;

/// Record kind under which snapshots are stored in the log.
pub const SNAPSHOT_KIND: &str = "agent-fleet";

/// Serializable projection of a worker instance (no process handle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedInstance {
    pub id: u32,
    pub type_name: String,
    pub status: WorkerStatus,
    pub task: String,
    pub output_chunks: Vec<String>,
    pub tool_invocation_count: u32,
    pub elapsed_millis: u64,
    pub session_file: PathBuf,
    pub turn_count: u32,
}

impl From<&WorkerInstance> for PersistedInstance {
    fn from(inst: &WorkerInstance) -> Self {
        Self {
            id: inst.id,
            type_name: inst.def.name.clone(),
            status: inst.status,
            task: inst.task.clone(),
            output_chunks: inst.output_chunks.clone(),
            tool_invocation_count: inst.tool_invocations,
            elapsed_millis: inst.elapsed_ms,
            session_file: inst.session_file.clone(),
            turn_count: inst.turn_count,
        }
    }
}

/// Full registry snapshot: instances plus per-type id counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub instances: Vec<PersistedInstance>,
    pub type_counters: Vec<(String, u32)>,
}

/// Project the registry into a snapshot.
///
/// Instances are sorted by key so logically identical registries always
/// serialize identically (the dedup check depends on it).
pub async fn snapshot_of(registry: &Registry) -> FleetSnapshot {
    let mut instances: Vec<PersistedInstance> = registry
        .values()
        .await
        .iter()
        .map(PersistedInstance::from)
        .collect();
    instances.sort_by(|a, b| {
        (a.type_name.to_lowercase(), a.id).cmp(&(b.type_name.to_lowercase(), b.id))
    });

    FleetSnapshot {
        instances,
        type_counters: registry.counters().await,
    }
}

#[derive(Default)]
struct PersistState {
    pending: Option<JoinHandle<()>>,
    last_saved: Option<String>,
}

/// Debounced, deduplicated snapshot writer.
pub struct Persister {
    log: Arc<dyn SnapshotLog>,
    debounce: Duration,
    state: Mutex<PersistState>,
}

impl Persister {
    /// Create a persister over a log with the given debounce window.
    pub fn new(log: Arc<dyn SnapshotLog>, debounce: Duration) -> Self {
        Self {
            log,
            debounce,
            state: Mutex::new(PersistState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, PersistState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The underlying log.
    pub fn log(&self) -> &dyn SnapshotLog {
        &*self.log
    }

    /// Schedule a save. Each call cancels any pending timer and restarts the
    /// debounce window, so bursts collapse into a single write.
    pub fn schedule(self: &Arc<Self>, registry: Arc<Registry>) {
        let mut state = self.state();
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        let this = Arc::clone(self);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            this.save_now(&registry).await;
        }));
    }

    /// Serialize the registry and append it, unless it matches the last
    /// written snapshot. Failures are logged and swallowed; persistence is
    /// never fatal to the fleet.
    pub async fn save_now(&self, registry: &Registry) {
        let snapshot = snapshot_of(registry).await;
        let serialized = match serde_json::to_string(&snapshot) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to serialize fleet snapshot");
                return;
            }
        };

        if self.state().last_saved.as_deref() == Some(serialized.as_str()) {
            debug!("Snapshot unchanged; skipping write");
            return;
        }

        let record = serde_json::json!({ "kind": SNAPSHOT_KIND, "data": snapshot });
        if let Err(e) = self.log.append(record).await {
            warn!(error = %e, "Failed to persist fleet snapshot");
            return;
        }
        self.state().last_saved = Some(serialized);
    }

    /// Drop any pending timer without writing.
    pub fn cancel(&self) {
        if let Some(pending) = self.state().pending.take() {
            pending.abort();
        }
    }

    /// Cancel any pending timer and save immediately (orderly shutdown).
    pub async fn flush(&self, registry: &Registry) {
        self.cancel();
        self.save_now(registry).await;
    }

    /// Forget the last-written marker and drop any pending timer. Invoked on
    /// session identity changes so one session's state is never conflated
    /// with another's.
    pub fn reset(&self) {
        self.cancel();
        self.state().last_saved = None;
    }
}

/// Find the most recent snapshot in the log.
///
/// A log read failure is treated as "no prior state". The newest record of
/// the recognized kind must pass a basic structural check (array-shaped
/// instance list) or nothing is restored.
pub async fn load_snapshot(log: &dyn SnapshotLog) -> Option<FleetSnapshot> {
    let records = match log.read_all().await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "Failed to read snapshot log; starting empty");
            return None;
        }
    };

    let record = records
        .iter()
        .rev()
        .find(|r| r.get("kind").and_then(|k| k.as_str()) == Some(SNAPSHOT_KIND))?;
    let data = record.get("data")?;

    if !data.get("instances").is_some_and(serde_json::Value::is_array) {
        warn!("Latest snapshot record is malformed; starting empty");
        return None;
    }

    serde_json::from_value(data.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkerDef;
    use crate::store::MemoryLog;

    fn instance(name: &str, id: u32) -> WorkerInstance {
        WorkerInstance {
            id,
            def: Arc::new(WorkerDef::new(name)),
            status: WorkerStatus::Done,
            task: "task".to_string(),
            output_chunks: vec!["out".to_string()],
            tool_invocations: 2,
            elapsed_ms: 1500,
            session_file: PathBuf::from("/tmp/s.jsonl"),
            turn_count: 1,
            process: None,
        }
    }

    #[tokio::test]
    async fn snapshot_uses_wire_field_names() {
        let registry = Registry::new();
        registry.next_id("scout").await;
        registry.insert(instance("scout", 1)).await;

        let snapshot = snapshot_of(&registry).await;
        let value = serde_json::to_value(&snapshot).unwrap();

        let inst = &value["instances"][0];
        assert_eq!(inst["typeName"], "scout");
        assert_eq!(inst["toolInvocationCount"], 2);
        assert_eq!(inst["elapsedMillis"], 1500);
        assert_eq!(inst["turnCount"], 1);
        assert_eq!(value["typeCounters"][0][0], "scout");
        assert_eq!(value["typeCounters"][0][1], 2);
    }

    #[tokio::test]
    async fn snapshot_order_is_deterministic() {
        let registry = Registry::new();
        registry.insert(instance("zeta", 1)).await;
        registry.insert(instance("alpha", 2)).await;
        registry.insert(instance("alpha", 1)).await;

        let snapshot = snapshot_of(&registry).await;
        let keys: Vec<_> = snapshot
            .instances
            .iter()
            .map(|i| (i.type_name.clone(), i.id))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("alpha".to_string(), 1),
                ("alpha".to_string(), 2),
                ("zeta".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn save_now_skips_identical_snapshots() {
        let log = Arc::new(MemoryLog::new());
        let persister = Persister::new(log.clone(), Duration::from_secs(5));
        let registry = Registry::new();
        registry.insert(instance("scout", 1)).await;

        persister.save_now(&registry).await;
        persister.save_now(&registry).await;
        assert_eq!(log.len().await, 1);

        registry
            .update(&crate::instance::InstanceKey::new("scout", 1), |i| {
                i.turn_count += 1
            })
            .await
            .unwrap();
        persister.save_now(&registry).await;
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_debounces_bursts() {
        let log = Arc::new(MemoryLog::new());
        let persister = Arc::new(Persister::new(log.clone(), Duration::from_secs(5)));
        let registry = Arc::new(Registry::new());
        registry.insert(instance("scout", 1)).await;

        persister.schedule(Arc::clone(&registry));
        persister.schedule(Arc::clone(&registry));
        persister.schedule(Arc::clone(&registry));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_save() {
        let log = Arc::new(MemoryLog::new());
        let persister = Arc::new(Persister::new(log.clone(), Duration::from_secs(5)));
        let registry = Arc::new(Registry::new());
        registry.insert(instance("scout", 1)).await;

        persister.schedule(Arc::clone(&registry));
        persister.reset();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn flush_saves_immediately() {
        let log = Arc::new(MemoryLog::new());
        let persister = Arc::new(Persister::new(log.clone(), Duration::from_secs(3600)));
        let registry = Arc::new(Registry::new());
        registry.insert(instance("scout", 1)).await;

        persister.schedule(Arc::clone(&registry));
        persister.flush(&registry).await;
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn load_returns_latest_snapshot() {
        let old = serde_json::json!({"kind": SNAPSHOT_KIND, "data": {
            "instances": [], "typeCounters": [["scout", 2]]
        }});
        let new = serde_json::json!({"kind": SNAPSHOT_KIND, "data": {
            "instances": [], "typeCounters": [["scout", 7]]
        }});
        let log = MemoryLog::with_records([old, new]);

        let snapshot = load_snapshot(&log).await.unwrap();
        assert_eq!(snapshot.type_counters, vec![("scout".to_string(), 7)]);
    }

    #[tokio::test]
    async fn load_ignores_other_record_kinds() {
        let log = MemoryLog::with_records([
            serde_json::json!({"kind": "chat-message", "data": {"text": "hi"}}),
        ]);
        assert!(load_snapshot(&log).await.is_none());
    }

    #[tokio::test]
    async fn load_rejects_non_array_instances() {
        let log = MemoryLog::with_records([serde_json::json!({
            "kind": SNAPSHOT_KIND,
            "data": {"instances": 42, "typeCounters": []}
        })]);
        assert!(load_snapshot(&log).await.is_none());
    }

    #[tokio::test]
    async fn load_empty_log_is_none() {
        assert!(load_snapshot(&MemoryLog::new()).await.is_none());
    }
}
