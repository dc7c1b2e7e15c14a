//! Fleet orchestration — the operations callers use.
//!
//! A `Fleet` owns the registry, the advisory gate, and the persistence
//! schedule, and wires supervised activations to all three. Collaborators
//! (definition store, launcher, log, observer) are injected so tests run the
//! whole engine against fakes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::FleetConfig;
use crate::definition::{DefinitionStore, WorkerDef};
use crate::error::{DefinitionError, Error, InstanceError, Result};
use crate::gate::SpawnGate;
use crate::instance::{InstanceKey, WorkerInstance, WorkerStatus, session_file_path};
use crate::observer::FleetObserver;
use crate::persistence::{Persister, load_snapshot};
use crate::registry::Registry;
use crate::store::SnapshotLog;
use crate::supervisor::{LaunchSpec, WorkerLauncher, supervise};

/// Outcome of `clear_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearSummary {
    /// Instances removed from the registry.
    pub count: usize,
    /// How many of them had a live subprocess that was asked to terminate.
    pub killed: usize,
}

/// Outcome of a startup restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Instances put back into the registry.
    pub restored: usize,
    /// Instances dropped because their type definition no longer resolves.
    pub dropped: usize,
    /// Restored instances whose persisted status was Running (stale — they
    /// have no live process).
    pub running: usize,
    /// Restored instances in Done state.
    pub done: usize,
    /// Restored instances in Error state.
    pub errored: usize,
}

/// The worker-instance orchestration engine.
pub struct Fleet {
    config: FleetConfig,
    definitions: Arc<dyn DefinitionStore>,
    launcher: Arc<dyn WorkerLauncher>,
    registry: Arc<Registry>,
    persister: Arc<Persister>,
    observer: Arc<dyn FleetObserver>,
    gate: SpawnGate,
}

impl Fleet {
    /// Assemble a fleet from its collaborators.
    pub fn new(
        config: FleetConfig,
        definitions: Arc<dyn DefinitionStore>,
        launcher: Arc<dyn WorkerLauncher>,
        log: Arc<dyn SnapshotLog>,
        observer: Arc<dyn FleetObserver>,
    ) -> Self {
        let persister = Arc::new(Persister::new(log, config.save_debounce));
        Self {
            config,
            definitions,
            launcher,
            registry: Arc::new(Registry::new()),
            persister,
            observer,
            gate: SpawnGate::new(),
        }
    }

    /// The definition store this fleet resolves worker types against.
    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    /// The instance registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The advisory spawn gate.
    pub fn gate(&self) -> &SpawnGate {
        &self.gate
    }

    fn schedule_save(&self) {
        self.persister.schedule(Arc::clone(&self.registry));
    }

    fn touch(&self) {
        self.observer.refresh();
        self.schedule_save();
    }

    fn launch_spec(inst: &WorkerInstance, task: &str) -> LaunchSpec {
        LaunchSpec {
            session_file: inst.session_file.clone(),
            model: inst.def.model.clone(),
            capabilities: inst.def.capabilities.clone(),
            system_prompt: inst.def.system_prompt.clone(),
            task: task.to_string(),
        }
    }

    async fn lookup_def(&self, name: &str) -> Result<Arc<WorkerDef>> {
        match self.definitions.lookup(name).await {
            Some(def) => Ok(def),
            None => {
                let available = self
                    .definitions
                    .all()
                    .await
                    .iter()
                    .map(|d| d.name.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(DefinitionError::NotFound {
                    name: name.to_string(),
                    available,
                }
                .into())
            }
        }
    }

    fn check_gate(&self) -> Result<()> {
        if self.gate.try_pass() {
            Ok(())
        } else {
            Err(Error::SpawnBlocked)
        }
    }

    /// Allocate an id and build a fresh Running instance. The instance is not
    /// registered yet; `spawn_single`/`spawn_parallel` do that.
    pub async fn create(&self, def: &Arc<WorkerDef>, task: &str) -> Result<WorkerInstance> {
        std::fs::create_dir_all(&self.config.sessions_dir)?;
        let id = self.registry.next_id(&def.name).await;
        Ok(WorkerInstance {
            id,
            def: Arc::clone(def),
            status: WorkerStatus::Running,
            task: task.to_string(),
            output_chunks: Vec::new(),
            tool_invocations: 0,
            elapsed_ms: 0,
            session_file: session_file_path(&self.config.sessions_dir, &def.name, id),
            turn_count: 1,
            process: None,
        })
    }

    /// Spawn one worker and wait for its first turn to finish.
    ///
    /// Ungated primitive: callers that want the enumerate-first nudge go
    /// through `spawn_one` / `send` instead.
    pub async fn spawn_single(
        &self,
        def: &Arc<WorkerDef>,
        task: &str,
        cancel: CancellationToken,
    ) -> Result<(WorkerInstance, String)> {
        let inst = self.create(def, task).await?;
        let key = inst.key();
        info!(worker = %key, model = %def.model, "Spawning worker");

        self.registry.insert(inst.clone()).await;
        self.touch();

        let result = supervise(
            &self.registry,
            &key,
            &*self.launcher,
            Self::launch_spec(&inst, task),
            &*self.observer,
            cancel,
            self.config.elapsed_tick,
        )
        .await;

        self.schedule_save();
        let final_inst = self.registry.get(&key).await.unwrap_or(inst);
        Ok((final_inst, result))
    }

    /// Spawn several workers on the same task.
    ///
    /// Every instance is registered before any subprocess launches, so the
    /// registry never shows a partially-populated batch. Launches are
    /// staggered by `index * stagger` and then run concurrently; resolves
    /// once all turns finish.
    pub async fn spawn_parallel(
        &self,
        defs: &[Arc<WorkerDef>],
        task: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<(WorkerInstance, String)>> {
        let mut insts = Vec::with_capacity(defs.len());
        for def in defs {
            let inst = self.create(def, task).await?;
            self.registry.insert(inst.clone()).await;
            self.touch();
            insts.push(inst);
        }
        info!(count = insts.len(), "Spawning worker batch");

        let activations = insts.iter().enumerate().map(|(index, inst)| {
            let key = inst.key();
            let spec = Self::launch_spec(inst, task);
            let delay = self.config.stagger * index as u32;
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(delay).await;
                supervise(
                    &self.registry,
                    &key,
                    &*self.launcher,
                    spec,
                    &*self.observer,
                    cancel,
                    self.config.elapsed_tick,
                )
                .await
            }
        });
        let results = futures::future::join_all(activations).await;

        self.schedule_save();

        let mut out = Vec::with_capacity(insts.len());
        for (inst, result) in insts.into_iter().zip(results) {
            let key = inst.key();
            out.push((self.registry.get(&key).await.unwrap_or(inst), result));
        }
        Ok(out)
    }

    /// Gated spawn by type name: refused once per gate cycle until active
    /// workers have been enumerated.
    pub async fn spawn_one(
        &self,
        type_name: &str,
        task: &str,
        cancel: CancellationToken,
    ) -> Result<(WorkerInstance, String)> {
        self.check_gate()?;
        let def = self.lookup_def(type_name).await?;
        let out = self.spawn_single(&def, task, cancel).await?;
        self.gate.reset();
        Ok(out)
    }

    /// Gated parallel spawn by type names. All names must resolve before
    /// anything launches.
    pub async fn spawn_many(
        &self,
        type_names: &[String],
        task: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<(WorkerInstance, String)>> {
        self.check_gate()?;
        let mut defs = Vec::with_capacity(type_names.len());
        for name in type_names {
            defs.push(self.lookup_def(name).await?);
        }
        let out = self.spawn_parallel(&defs, task, cancel).await?;
        self.gate.reset();
        Ok(out)
    }

    /// Send a task to a worker type: continue the most recent idle instance
    /// of that type, or spawn a fresh one (gated) when none exists or
    /// `force_new` is set.
    pub async fn send(
        &self,
        type_name: &str,
        task: &str,
        force_new: bool,
        cancel: CancellationToken,
    ) -> Result<(WorkerInstance, String)> {
        let def = self.lookup_def(type_name).await?;

        if !force_new {
            let candidate = self
                .registry
                .values()
                .await
                .into_iter()
                .filter(|i| i.def.name.eq_ignore_ascii_case(type_name) && !i.status.is_running())
                .max_by_key(|i| i.id);

            if let Some(candidate) = candidate {
                debug!(worker = %candidate.key(), "Continuing existing worker");
                return self
                    .continue_worker(&candidate.def.name, candidate.id, task, cancel)
                    .await;
            }
        }

        self.check_gate()?;
        let out = self.spawn_single(&def, task, cancel).await?;
        self.gate.reset();
        Ok(out)
    }

    /// Run another turn on an existing instance, reusing its session file so
    /// the worker keeps its conversational memory.
    pub async fn continue_worker(
        &self,
        type_name: &str,
        id: u32,
        task: &str,
        cancel: CancellationToken,
    ) -> Result<(WorkerInstance, String)> {
        let key = InstanceKey::new(type_name, id);
        let inst = self
            .registry
            .get(&key)
            .await
            .ok_or_else(|| InstanceError::NotFound {
                type_name: key.type_name().to_string(),
                id,
            })?;

        if inst.status.is_running() {
            return Err(InstanceError::StillRunning {
                type_name: key.type_name().to_string(),
                id,
            }
            .into());
        }

        let inst = self
            .registry
            .update(&key, |inst| {
                inst.status = WorkerStatus::Running;
                inst.task = task.to_string();
                inst.output_chunks.clear();
                inst.elapsed_ms = 0;
                inst.turn_count += 1;
                inst.clone()
            })
            .await?;
        info!(worker = %key, turn = inst.turn_count, "Continuing worker");
        self.touch();

        let result = supervise(
            &self.registry,
            &key,
            &*self.launcher,
            Self::launch_spec(&inst, task),
            &*self.observer,
            cancel,
            self.config.elapsed_tick,
        )
        .await;

        self.schedule_save();
        let final_inst = self.registry.get(&key).await.unwrap_or(inst);
        Ok((final_inst, result))
    }

    /// Remove an instance, terminating its subprocess if one is live.
    /// Returns `None` when no instance exists at that key.
    pub async fn remove(&self, type_name: &str, id: u32) -> Option<WorkerInstance> {
        let key = InstanceKey::new(type_name, id);
        let removed = self.registry.remove(&key).await?;

        if removed.status.is_running() {
            if let Some(handle) = &removed.process {
                handle.terminate();
            }
        }

        info!(worker = %key, "Worker removed");
        self.touch();
        Some(removed)
    }

    /// Terminate every running worker and empty the registry.
    pub async fn clear_all(&self) -> ClearSummary {
        let all = self.registry.values().await;
        let mut killed = 0;
        for inst in &all {
            if inst.status.is_running() {
                if let Some(handle) = &inst.process {
                    handle.terminate();
                    killed += 1;
                }
            }
        }

        let count = all.len();
        self.registry.clear_instances().await;
        self.schedule_save();
        info!(count, killed, "Cleared all workers");
        ClearSummary { count, killed }
    }

    /// Wipe all runtime state for a new session identity: running workers
    /// are terminated, instances *and* counters cleared, the gate closed,
    /// and the persistence marker reset.
    pub async fn reset_session(&self) {
        for inst in self.registry.values().await {
            if inst.status.is_running() {
                if let Some(handle) = &inst.process {
                    handle.terminate();
                }
            }
        }
        self.registry.clear_all_state().await;
        self.gate.reset();
        self.persister.reset();
        self.observer.refresh();
        info!("Fleet session state reset");
    }

    /// All instances, ordered by the configured type priority and then by
    /// ascending id. Types outside the priority list sort after listed ones.
    /// Enumerating arms the advisory gate.
    pub async fn list_active(&self) -> Vec<WorkerInstance> {
        self.gate.arm();

        let rank = |name: &str| {
            self.config
                .type_priority
                .iter()
                .position(|p| p.eq_ignore_ascii_case(name))
                .unwrap_or(self.config.type_priority.len())
        };

        let mut instances = self.registry.values().await;
        instances.sort_by_key(|inst| (rank(&inst.def.name), inst.id));
        instances
    }

    /// Restore the registry from the most recent persisted snapshot.
    ///
    /// Counters merge by the max rule; instances whose type no longer
    /// resolves are dropped. Restored "running" instances are stale — they
    /// carry no process handle.
    pub async fn restore_from_log(&self) -> RestoreSummary {
        let Some(snapshot) = load_snapshot(self.persister_log()).await else {
            return RestoreSummary::default();
        };

        self.registry.merge_counters(snapshot.type_counters).await;

        let mut summary = RestoreSummary::default();
        for persisted in snapshot.instances {
            let Some(def) = self.definitions.lookup(&persisted.type_name).await else {
                debug!(type_name = %persisted.type_name, id = persisted.id,
                    "Dropping restored instance: type no longer defined");
                summary.dropped += 1;
                continue;
            };

            match persisted.status {
                WorkerStatus::Running => summary.running += 1,
                WorkerStatus::Done => summary.done += 1,
                WorkerStatus::Error => summary.errored += 1,
            }

            self.registry
                .insert(WorkerInstance {
                    id: persisted.id,
                    def,
                    status: persisted.status,
                    task: persisted.task,
                    output_chunks: persisted.output_chunks,
                    tool_invocations: persisted.tool_invocation_count,
                    elapsed_ms: persisted.elapsed_millis,
                    session_file: persisted.session_file,
                    turn_count: persisted.turn_count,
                    process: None,
                })
                .await;
            summary.restored += 1;
        }

        if summary.restored > 0 {
            info!(
                restored = summary.restored,
                dropped = summary.dropped,
                "Restored workers from previous session"
            );
            self.observer.refresh();
        }
        summary
    }

    /// Write any unsaved state now (orderly shutdown).
    pub async fn flush(&self) {
        self.persister.flush(&self.registry).await;
    }

    fn persister_log(&self) -> &dyn SnapshotLog {
        self.persister.log()
    }
}
