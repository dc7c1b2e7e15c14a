//! Progress callbacks consumed by the display layer.

use crate::instance::{InstanceKey, WorkerStatus};

/// Live-progress hooks the display layer implements.
///
/// All methods default to no-ops; the core never depends on what an observer
/// does with them. `refresh` fires after any registry mutation, the rest fire
/// per activation as the worker's stream is parsed.
pub trait FleetObserver: Send + Sync {
    /// The set of instances changed; re-render any overview.
    fn refresh(&self) {}

    /// A text fragment arrived for the given instance.
    fn text_delta(&self, _key: &InstanceKey, _chunk: &str) {}

    /// The worker started a tool invocation.
    fn tool_start(&self, _key: &InstanceKey) {}

    /// The activation finished; fires exactly once per activation.
    fn status_change(&self, _key: &InstanceKey, _status: WorkerStatus, _elapsed_ms: u64) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl FleetObserver for NullObserver {}
