//! Error types for agent-fleet.

/// Top-level error type for the fleet.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Instance error: {0}")]
    Instance(#[from] InstanceError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(
        "Spawn refused: enumerate active workers first. \
         If a relevant worker already exists, continue it instead of spawning a new one."
    )]
    SpawnBlocked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker type definition errors.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Worker type \"{name}\" not found. Available: {available}")]
    NotFound { name: String, available: String },
}

/// Worker instance errors.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("No {type_name} #{id} found")]
    NotFound { type_name: String, id: u32 },

    #[error("{type_name} #{id} is still running")]
    StillRunning { type_name: String, id: u32 },
}

/// Snapshot log errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Log operation failed: {0}")]
    Log(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the fleet.
pub type Result<T> = std::result::Result<T, Error>;
