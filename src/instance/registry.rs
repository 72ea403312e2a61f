use super::{VmRecord, VmStatus};
use crate::error::{HiveError, Result};
use crate::kv::KvGateway;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Persisted form of the local registry: the full VM map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub vms: HashMap<String, VmRecord>,
}

/// Process-wide map from VM id to record, guarded by a single lock.
///
/// Lock order is always registry first, then a record's EBS-list lock.
/// Handlers snapshot the fields they need under the lock and do their I/O
/// with the lock released; KV persists of the registry happen while the lock
/// is held so concurrent transitions serialize.
pub struct Registry {
    node_id: String,
    inner: Mutex<HashMap<String, VmRecord>>,
}

impl Registry {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild from a persisted snapshot; locks are constructed fresh.
    pub fn restore(node_id: impl Into<String>, snapshot: RegistrySnapshot) -> Self {
        Self {
            node_id: node_id.into(),
            inner: Mutex::new(snapshot.vms),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn insert(&self, vm: VmRecord) -> Result<()> {
        let mut map = self.inner.lock().await;
        if map.contains_key(&vm.id) {
            return Err(HiveError::InstanceAlreadyExists(vm.id));
        }
        map.insert(vm.id.clone(), vm);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Option<VmRecord> {
        self.inner.lock().await.remove(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    pub async fn get_clone(&self, id: &str) -> Option<VmRecord> {
        self.inner.lock().await.get(id).cloned()
    }

    pub async fn status_of(&self, id: &str) -> Option<VmStatus> {
        self.inner.lock().await.get(id).map(|vm| vm.status)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Mutate one record under the registry lock.
    pub async fn with_vm<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut VmRecord) -> R,
    ) -> Result<R> {
        let mut map = self.inner.lock().await;
        let vm = map
            .get_mut(id)
            .ok_or_else(|| HiveError::InstanceNotFound(id.to_string()))?;
        Ok(f(vm))
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            vms: self.inner.lock().await.clone(),
        }
    }

    /// Persist the full registry to the KV store.
    pub async fn persist(&self, kv: &KvGateway) -> Result<()> {
        let map = self.inner.lock().await;
        let snapshot = RegistrySnapshot { vms: map.clone() };
        kv.write_state(&self.node_id, &snapshot).await
    }

    /// Validate and apply a state transition, then persist the registry
    /// while still holding the lock.
    ///
    /// On persist failure the in-memory change is retained and the error
    /// returned; callers needing atomicity revert explicitly.
    pub async fn transition(&self, kv: &KvGateway, id: &str, target: VmStatus) -> Result<()> {
        let mut map = self.inner.lock().await;
        let vm = map
            .get_mut(id)
            .ok_or_else(|| HiveError::InstanceNotFound(id.to_string()))?;

        let from = vm.status;
        if !from.can_transition(target) {
            return Err(HiveError::InvalidTransition {
                from: from.to_string(),
                to: target.to_string(),
                id: id.to_string(),
            });
        }

        vm.apply_status(target);
        info!("Instance {} transition {} -> {}", id, from, target);

        let snapshot = RegistrySnapshot { vms: map.clone() };
        if let Err(e) = kv.write_state(&self.node_id, &snapshot).await {
            warn!("Persist after transition of {} failed: {}", id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Set the status without the allow-list check. Recovery uses this to
    /// force observed reality onto the record.
    pub async fn force_status(&self, id: &str, target: VmStatus) -> Result<()> {
        self.with_vm(id, |vm| vm.apply_status(target)).await
    }

    /// Replace the whole map with a persisted snapshot. Recovery only.
    pub async fn replace_all(&self, snapshot: RegistrySnapshot) {
        *self.inner.lock().await = snapshot.vms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvGateway, MemoryKv};
    use std::sync::Arc;

    async fn kv() -> (Arc<MemoryKv>, KvGateway) {
        let provider = Arc::new(MemoryKv::new());
        let gateway = KvGateway::open(provider.clone(), 1).await.unwrap();
        (provider, gateway)
    }

    #[tokio::test]
    async fn test_valid_transition_persists() {
        let (_provider, kv) = kv().await;
        let registry = Registry::new("node0");
        registry
            .insert(VmRecord::new("i-1", "r-1", "t3.micro", "ami-1"))
            .await
            .unwrap();

        registry
            .transition(&kv, "i-1", VmStatus::Running)
            .await
            .unwrap();
        assert_eq!(registry.status_of("i-1").await, Some(VmStatus::Running));

        let stored = kv.load_state("node0").await.unwrap().unwrap();
        assert_eq!(stored.vms["i-1"].status, VmStatus::Running);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected_without_change() {
        let (_provider, kv) = kv().await;
        let registry = Registry::new("node0");
        let mut vm = VmRecord::new("i-1", "r-1", "t3.micro", "ami-1");
        vm.apply_status(VmStatus::Stopping);
        registry.insert(vm).await.unwrap();

        let err = registry
            .transition(&kv, "i-1", VmStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::InvalidTransition { .. }));
        assert_eq!(registry.status_of("i-1").await, Some(VmStatus::Stopping));
        // Nothing was persisted for the rejected move.
        assert!(kv.load_state("node0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_change() {
        let (provider, kv) = kv().await;
        let registry = Registry::new("node0");
        registry
            .insert(VmRecord::new("i-1", "r-1", "t3.micro", "ami-1"))
            .await
            .unwrap();

        // Two injected failures: the write and its recovery retry both fail.
        provider
            .bucket(crate::kv::INSTANCE_STATE_BUCKET)
            .unwrap()
            .inject_stream_failures(2);

        let err = registry
            .transition(&kv, "i-1", VmStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Kv(_)));
        // In-memory status is retained for the caller to revert or retry.
        assert_eq!(registry.status_of("i-1").await, Some(VmStatus::Running));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_via_kv() {
        let (_provider, kv) = kv().await;
        let registry = Registry::new("node0");
        let vm = VmRecord::new("i-1", "r-1", "t3.micro", "ami-1");
        vm.upsert_ebs(crate::instance::EbsRequest::data_volume("vol-1", "/dev/sdf"));
        registry.insert(vm).await.unwrap();
        registry.persist(&kv).await.unwrap();

        let snapshot = kv.load_state("node0").await.unwrap().unwrap();
        let restored = Registry::restore("node0", snapshot);
        let vm = restored.get_clone("i-1").await.unwrap();
        assert_eq!(vm.instance_type, "t3.micro");
        assert_eq!(vm.ebs_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_duplicate_rejected() {
        let registry = Registry::new("node0");
        registry
            .insert(VmRecord::new("i-1", "r-1", "t3.micro", "ami-1"))
            .await
            .unwrap();
        let err = registry
            .insert(VmRecord::new("i-1", "r-2", "t3.micro", "ami-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::InstanceAlreadyExists(_)));
    }
}
