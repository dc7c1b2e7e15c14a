//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Worker CLI executable launched for each activation.
    pub executable: PathBuf,
    /// Directory where per-instance session transcripts are created.
    pub sessions_dir: PathBuf,
    /// Directory scanned for worker type definition files.
    pub definitions_dir: PathBuf,
    /// Debounce window for snapshot persistence.
    pub save_debounce: Duration,
    /// Per-index launch delay for parallel batches (avoids session-file
    /// contention when many workers initialize at once).
    pub stagger: Duration,
    /// Time-to-live of the definition cache.
    pub definition_ttl: Duration,
    /// Sampling interval for elapsed-time updates while a worker runs.
    pub elapsed_tick: Duration,
    /// Worker types listed first by `list_active`, in this order.
    pub type_priority: Vec<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("pi"),
            sessions_dir: PathBuf::from("./data/sessions"),
            definitions_dir: PathBuf::from("./agents"),
            save_debounce: Duration::from_secs(5),
            stagger: Duration::from_millis(150),
            definition_ttl: Duration::from_secs(5),
            elapsed_tick: Duration::from_secs(1),
            type_priority: vec![
                "scout".to_string(),
                "coder".to_string(),
                "reviewer".to_string(),
                "youtrack".to_string(),
            ],
        }
    }
}
