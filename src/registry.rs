//! Instance registry and per-type id allocation.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::InstanceError;
use crate::instance::{InstanceKey, WorkerInstance};

/// In-memory store of worker instances plus the per-type id counters.
///
/// Counters hold the *next* id to issue for a type, starting at 1. Both maps
/// are only ever touched through `&self` methods so every orchestration entry
/// point shares one registry behind an `Arc`.
#[derive(Default)]
pub struct Registry {
    instances: RwLock<HashMap<InstanceKey, WorkerInstance>>,
    counters: RwLock<HashMap<String, u32>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next id for a type. Ids are strictly increasing per type
    /// for the lifetime of the process.
    pub async fn next_id(&self, type_name: &str) -> u32 {
        let mut counters = self.counters.write().await;
        let slot = counters.entry(type_name.to_lowercase()).or_insert(1);
        let id = *slot;
        *slot = id + 1;
        id
    }

    /// Merge restored counters: for each type, keep the larger of the saved
    /// and in-memory values so ids stay monotonic across a restart.
    pub async fn merge_counters(&self, saved: Vec<(String, u32)>) {
        let mut counters = self.counters.write().await;
        for (name, next) in saved {
            let slot = counters.entry(name.to_lowercase()).or_insert(1);
            *slot = (*slot).max(next);
        }
    }

    /// Export the counters for a snapshot, sorted by type name.
    pub async fn counters(&self) -> Vec<(String, u32)> {
        let counters = self.counters.read().await;
        let mut out: Vec<_> = counters.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Store an instance under its key, replacing any previous record.
    pub async fn insert(&self, inst: WorkerInstance) {
        self.instances.write().await.insert(inst.key(), inst);
    }

    /// Fetch a copy of an instance.
    pub async fn get(&self, key: &InstanceKey) -> Option<WorkerInstance> {
        self.instances.read().await.get(key).cloned()
    }

    /// Mutate an instance in place.
    pub async fn update<F, R>(&self, key: &InstanceKey, f: F) -> Result<R, InstanceError>
    where
        F: FnOnce(&mut WorkerInstance) -> R,
    {
        let mut instances = self.instances.write().await;
        let inst = instances.get_mut(key).ok_or_else(|| InstanceError::NotFound {
            type_name: key.type_name().to_string(),
            id: key.id(),
        })?;
        Ok(f(inst))
    }

    /// Remove an instance. Removing a missing key is a no-op returning `None`.
    pub async fn remove(&self, key: &InstanceKey) -> Option<WorkerInstance> {
        self.instances.write().await.remove(key)
    }

    /// Copies of all stored instances, in unspecified order.
    pub async fn values(&self) -> Vec<WorkerInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Number of stored instances.
    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Whether the registry holds no instances.
    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Drop every instance; counters are left untouched so ids keep
    /// advancing within the process.
    pub async fn clear_instances(&self) {
        self.instances.write().await.clear();
    }

    /// Drop instances and counters both (session identity change).
    pub async fn clear_all_state(&self) {
        self.instances.write().await.clear();
        self.counters.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::definition::WorkerDef;
    use crate::instance::WorkerStatus;

    fn instance(name: &str, id: u32) -> WorkerInstance {
        WorkerInstance {
            id,
            def: Arc::new(WorkerDef::new(name)),
            status: WorkerStatus::Running,
            task: String::new(),
            output_chunks: Vec::new(),
            tool_invocations: 0,
            elapsed_ms: 0,
            session_file: PathBuf::new(),
            turn_count: 1,
            process: None,
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_per_type() {
        let registry = Registry::new();

        assert_eq!(registry.next_id("scout").await, 1);
        assert_eq!(registry.next_id("scout").await, 2);
        assert_eq!(registry.next_id("coder").await, 1);
        assert_eq!(registry.next_id("Scout").await, 3);
    }

    #[tokio::test]
    async fn merge_counters_takes_the_max() {
        let registry = Registry::new();
        registry.next_id("scout").await; // counter now 2
        registry
            .merge_counters(vec![("scout".to_string(), 5), ("coder".to_string(), 3)])
            .await;

        assert_eq!(registry.next_id("scout").await, 5);
        assert_eq!(registry.next_id("coder").await, 3);
    }

    #[tokio::test]
    async fn merge_counters_keeps_larger_in_memory_value() {
        let registry = Registry::new();
        for _ in 0..6 {
            registry.next_id("scout").await;
        }
        registry.merge_counters(vec![("scout".to_string(), 2)]).await;

        assert_eq!(registry.next_id("scout").await, 7);
    }

    #[tokio::test]
    async fn keys_are_unique_and_case_insensitive() {
        let registry = Registry::new();
        registry.insert(instance("Scout", 1)).await;
        registry.insert(instance("scout", 1)).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&InstanceKey::new("SCOUT", 1)).await.is_some());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = Registry::new();
        registry.insert(instance("scout", 1)).await;

        let key = InstanceKey::new("scout", 1);
        assert!(registry.remove(&key).await.is_some());
        assert!(registry.remove(&key).await.is_none());
    }

    #[tokio::test]
    async fn update_missing_key_reports_not_found() {
        let registry = Registry::new();
        let err = registry
            .update(&InstanceKey::new("scout", 9), |i| i.turn_count += 1)
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::NotFound { id: 9, .. }));
    }

    #[tokio::test]
    async fn clear_instances_preserves_counters() {
        let registry = Registry::new();
        registry.next_id("scout").await;
        registry.insert(instance("scout", 1)).await;

        registry.clear_instances().await;

        assert!(registry.is_empty().await);
        assert_eq!(registry.next_id("scout").await, 2);
    }

    #[tokio::test]
    async fn clear_all_state_resets_counters() {
        let registry = Registry::new();
        registry.next_id("scout").await;
        registry.clear_all_state().await;

        assert_eq!(registry.next_id("scout").await, 1);
    }

    #[tokio::test]
    async fn counters_export_is_sorted() {
        let registry = Registry::new();
        registry.next_id("zeta").await;
        registry.next_id("alpha").await;

        assert_eq!(
            registry.counters().await,
            vec![("alpha".to_string(), 2), ("zeta".to_string(), 2)]
        );
    }
}
