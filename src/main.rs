use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use agent_fleet::config::FleetConfig;
use agent_fleet::definition::{DefinitionStore, MarkdownDefinitionStore};
use agent_fleet::instance::WorkerStatus;
use agent_fleet::observer::NullObserver;
use agent_fleet::orchestrator::Fleet;
use agent_fleet::store::{LibSqlLog, SnapshotLog};
use agent_fleet::supervisor::CliLauncher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(worker_type) = args.next() else {
        eprintln!("Usage: agent-fleet <worker-type> <task...>");
        std::process::exit(2);
    };
    let task = args.collect::<Vec<_>>().join(" ");
    if task.is_empty() {
        eprintln!("Usage: agent-fleet <worker-type> <task...>");
        std::process::exit(2);
    }

    let mut config = FleetConfig::default();
    if let Ok(exe) = std::env::var("FLEET_WORKER_BIN") {
        config.executable = PathBuf::from(exe);
    }
    if let Ok(dir) = std::env::var("FLEET_DEFINITIONS_DIR") {
        config.definitions_dir = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("FLEET_SESSIONS_DIR") {
        config.sessions_dir = PathBuf::from(dir);
    }
    let db_path =
        std::env::var("FLEET_DB_PATH").unwrap_or_else(|_| "./data/agent-fleet.db".to_string());

    eprintln!("agent-fleet v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker CLI: {}", config.executable.display());
    eprintln!("   Definitions: {}", config.definitions_dir.display());
    eprintln!("   Log: {db_path}\n");

    let log: Arc<dyn SnapshotLog> = Arc::new(LibSqlLog::new_local(Path::new(&db_path)).await?);
    let definitions: Arc<dyn DefinitionStore> = Arc::new(MarkdownDefinitionStore::new(
        config.definitions_dir.clone(),
        config.definition_ttl,
    ));
    let launcher = Arc::new(CliLauncher::new(config.executable.clone()));
    let fleet = Fleet::new(config, definitions, launcher, log, Arc::new(NullObserver));

    let restored = fleet.restore_from_log().await;
    if restored.restored > 0 {
        eprintln!(
            "Restored {} worker(s) from previous run ({} dropped)",
            restored.restored, restored.dropped
        );
    }

    // One-shot command path: resolve the type and spawn directly, like the
    // original slash command (no advisory gate on this surface).
    let Some(def) = fleet.definitions().lookup(&worker_type).await else {
        let available = fleet
            .definitions()
            .all()
            .await
            .iter()
            .map(|d| d.name.clone())
            .collect::<Vec<_>>()
            .join(", ");
        eprintln!("Worker type \"{worker_type}\" not found. Available: {available}");
        std::process::exit(2);
    };

    let (inst, result) = fleet
        .spawn_single(&def, &task, CancellationToken::new())
        .await?;

    println!("{}", inst.summary(&result));
    fleet.flush().await;

    if inst.status == WorkerStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}
