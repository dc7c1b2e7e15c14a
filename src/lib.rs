//! agent-fleet — worker-instance orchestration core.
//!
//! Spawns, supervises, and persists ephemeral CLI worker subprocesses:
//! streaming output parsing, multi-turn continuation over session files,
//! and debounced snapshot persistence across restarts.

pub mod config;
pub mod definition;
pub mod error;
pub mod gate;
pub mod instance;
pub mod observer;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod store;
pub mod supervisor;
