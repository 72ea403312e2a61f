use crate::cluster::{ClusterShutdown, Heartbeat, ServiceManifest};
use crate::error::{HiveError, Result};
use crate::instance::{RegistrySnapshot, VmRecord};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const INSTANCE_STATE_BUCKET: &str = "hive-instance-state";
pub const CLUSTER_STATE_BUCKET: &str = "hive-cluster-state";

const INIT_ATTEMPTS: u32 = 10;
const INIT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const INIT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Bucket shape: name, history depth, optional TTL, replica count.
#[derive(Debug, Clone)]
pub struct BucketSpec {
    pub name: String,
    pub history: u8,
    pub ttl: Option<Duration>,
    pub replicas: usize,
}

/// Errors from a KV operation, with the "underlying stream is gone"
/// condition classified so callers can trigger bucket recovery.
pub fn is_stream_unavailable(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("stream not found")
        || m.contains("no responders")
        || m.contains("no stream response")
}

#[async_trait]
pub trait KvBucket: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait KvProvider: Send + Sync {
    /// Open the bucket, creating it with the spec if missing.
    async fn open_bucket(&self, spec: &BucketSpec) -> Result<Arc<dyn KvBucket>>;

    /// Raise the replica count on the bucket's underlying stream.
    async fn update_replicas(&self, spec: &BucketSpec, replicas: usize) -> Result<()>;
}

struct BucketHandle {
    spec: BucketSpec,
    // Serializes recovery so concurrent failures re-open the bucket once
    bucket: Mutex<Arc<dyn KvBucket>>,
}

impl BucketHandle {
    async fn open(provider: &dyn KvProvider, spec: BucketSpec) -> Result<Self> {
        let mut backoff = INIT_BACKOFF_BASE;
        let mut last_err = None;
        for attempt in 1..=INIT_ATTEMPTS {
            match provider.open_bucket(&spec).await {
                Ok(bucket) => {
                    return Ok(Self {
                        spec,
                        bucket: Mutex::new(bucket),
                    })
                }
                Err(e) => {
                    warn!(
                        "KV bucket {} init attempt {}/{} failed: {}",
                        spec.name, attempt, INIT_ATTEMPTS, e
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(INIT_BACKOFF_MAX);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| HiveError::Kv("bucket init failed".to_string())))
    }

    /// Re-open the bucket after a stream-unavailable failure. A missing
    /// bucket is recreated with the configured replica count, so loads after
    /// recovery legitimately come back empty.
    async fn recover(&self, provider: &dyn KvProvider) -> Result<()> {
        let mut guard = self.bucket.lock().await;
        info!("Recovering KV bucket {}", self.spec.name);
        let fresh = provider.open_bucket(&self.spec).await?;
        *guard = fresh;
        Ok(())
    }

    async fn current(&self) -> Arc<dyn KvBucket> {
        self.bucket.lock().await.clone()
    }
}

/// Typed gateway over the two replicated buckets.
pub struct KvGateway {
    provider: Arc<dyn KvProvider>,
    instance_state: BucketHandle,
    cluster_state: BucketHandle,
}

impl KvGateway {
    pub async fn open(provider: Arc<dyn KvProvider>, cluster_size: usize) -> Result<Self> {
        let instance_spec = BucketSpec {
            name: INSTANCE_STATE_BUCKET.to_string(),
            history: 1,
            ttl: None,
            replicas: cluster_size.max(1),
        };
        let cluster_spec = BucketSpec {
            name: CLUSTER_STATE_BUCKET.to_string(),
            history: 1,
            ttl: Some(Duration::from_secs(3600)),
            replicas: cluster_size.max(1),
        };

        let instance_state = BucketHandle::open(provider.as_ref(), instance_spec).await?;
        let cluster_state = BucketHandle::open(provider.as_ref(), cluster_spec).await?;

        Ok(Self {
            provider,
            instance_state,
            cluster_state,
        })
    }

    /// Run the operation; on a stream-unavailable failure recover the bucket
    /// and retry exactly once.
    async fn with_recovery<T, F, Fut>(&self, handle: &BucketHandle, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn KvBucket>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match op(handle.current().await).await {
            Ok(v) => Ok(v),
            Err(HiveError::Kv(msg)) if is_stream_unavailable(&msg) => {
                warn!("KV stream unavailable on {}: {}", handle.spec.name, msg);
                handle.recover(self.provider.as_ref()).await?;
                op(handle.current().await).await
            }
            Err(e) => Err(e),
        }
    }

    async fn put_json<T: Serialize>(
        &self,
        handle: &BucketHandle,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        self.with_recovery(handle, |bucket| {
            let payload = payload.clone();
            let key = key.to_string();
            async move { bucket.put(&key, payload).await }
        })
        .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        handle: &BucketHandle,
        key: &str,
    ) -> Result<Option<T>> {
        let raw = self
            .with_recovery(handle, |bucket| {
                let key = key.to_string();
                async move { bucket.get(&key).await }
            })
            .await?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_key(&self, handle: &BucketHandle, key: &str) -> Result<()> {
        self.with_recovery(handle, |bucket| {
            let key = key.to_string();
            async move { bucket.delete(&key).await }
        })
        .await
    }

    // --- node registry snapshots ---

    pub async fn write_state(&self, node: &str, registry: &RegistrySnapshot) -> Result<()> {
        self.put_json(&self.instance_state, &format!("node.{}", node), registry)
            .await
    }

    pub async fn load_state(&self, node: &str) -> Result<Option<RegistrySnapshot>> {
        self.get_json(&self.instance_state, &format!("node.{}", node))
            .await
    }

    // --- cluster-owned stopped instances ---

    pub async fn write_stopped(&self, id: &str, vm: &VmRecord) -> Result<()> {
        self.put_json(&self.instance_state, &format!("instance.{}", id), vm)
            .await
    }

    pub async fn load_stopped(&self, id: &str) -> Result<Option<VmRecord>> {
        self.get_json(&self.instance_state, &format!("instance.{}", id))
            .await
    }

    pub async fn delete_stopped(&self, id: &str) -> Result<()> {
        self.delete_key(&self.instance_state, &format!("instance.{}", id))
            .await
    }

    pub async fn list_stopped(&self) -> Result<Vec<VmRecord>> {
        let keys = self
            .with_recovery(&self.instance_state, |bucket| async move {
                bucket.keys().await
            })
            .await?;

        let mut out = Vec::new();
        for key in keys {
            let Some(id) = key.strip_prefix("instance.") else {
                continue;
            };
            if let Some(vm) = self.load_stopped(id).await? {
                out.push(vm);
            }
        }
        Ok(out)
    }

    // --- heartbeats ---

    pub async fn write_heartbeat(&self, node: &str, hb: &Heartbeat) -> Result<()> {
        self.put_json(&self.cluster_state, &format!("heartbeat.{}", node), hb)
            .await
    }

    pub async fn load_heartbeat(&self, node: &str) -> Result<Option<Heartbeat>> {
        self.get_json(&self.cluster_state, &format!("heartbeat.{}", node))
            .await
    }

    // --- clean-shutdown markers ---

    pub async fn write_shutdown_marker(&self, node: &str) -> Result<()> {
        self.put_json(
            &self.cluster_state,
            &format!("shutdown.{}", node),
            &chrono::Utc::now().timestamp(),
        )
        .await
    }

    pub async fn shutdown_marker_exists(&self, node: &str) -> Result<bool> {
        Ok(self
            .get_json::<i64>(&self.cluster_state, &format!("shutdown.{}", node))
            .await?
            .is_some())
    }

    pub async fn delete_shutdown_marker(&self, node: &str) -> Result<()> {
        self.delete_key(&self.cluster_state, &format!("shutdown.{}", node))
            .await
    }

    // --- coordinated cluster shutdown descriptor ---

    pub async fn write_cluster_shutdown(&self, state: &ClusterShutdown) -> Result<()> {
        self.put_json(&self.cluster_state, "cluster.shutdown", state)
            .await
    }

    pub async fn load_cluster_shutdown(&self) -> Result<Option<ClusterShutdown>> {
        self.get_json(&self.cluster_state, "cluster.shutdown").await
    }

    pub async fn delete_cluster_shutdown(&self) -> Result<()> {
        self.delete_key(&self.cluster_state, "cluster.shutdown")
            .await
    }

    // --- service manifest ---

    pub async fn write_services(&self, node: &str, manifest: &ServiceManifest) -> Result<()> {
        self.put_json(
            &self.cluster_state,
            &format!("node.{}.services", node),
            manifest,
        )
        .await
    }

    /// Raise the replica count on both buckets. Called when a node joins;
    /// decreases are never issued.
    pub async fn update_replicas(&self, replicas: usize) -> Result<()> {
        for handle in [&self.instance_state, &self.cluster_state] {
            if replicas <= handle.spec.replicas {
                continue;
            }
            self.provider
                .update_replicas(&handle.spec, replicas)
                .await?;
        }
        Ok(())
    }
}

/// JetStream-backed provider.
pub struct JetStreamKv {
    context: async_nats::jetstream::Context,
}

impl JetStreamKv {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            context: async_nats::jetstream::new(client),
        }
    }
}

struct JetStreamBucket {
    store: async_nats::jetstream::kv::Store,
}

#[async_trait]
impl KvBucket for JetStreamBucket {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.store
            .put(key, value)
            .await
            .map(|_| ())
            .map_err(|e| HiveError::Kv(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.store
            .get(key)
            .await
            .map_err(|e| HiveError::Kv(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(key)
            .await
            .map_err(|e| HiveError::Kv(e.to_string()))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let stream = self
            .store
            .keys()
            .await
            .map_err(|e| HiveError::Kv(e.to_string()))?;
        stream
            .try_collect()
            .await
            .map_err(|e| HiveError::Kv(e.to_string()))
    }
}

#[async_trait]
impl KvProvider for JetStreamKv {
    async fn open_bucket(&self, spec: &BucketSpec) -> Result<Arc<dyn KvBucket>> {
        let store = match self.context.get_key_value(spec.name.as_str()).await {
            Ok(store) => store,
            Err(_) => self
                .context
                .create_key_value(async_nats::jetstream::kv::Config {
                    bucket: spec.name.clone(),
                    history: spec.history as i64,
                    max_age: spec.ttl.unwrap_or_default(),
                    num_replicas: spec.replicas,
                    ..Default::default()
                })
                .await
                .map_err(|e| HiveError::Kv(e.to_string()))?,
        };
        Ok(Arc::new(JetStreamBucket { store }))
    }

    async fn update_replicas(&self, spec: &BucketSpec, replicas: usize) -> Result<()> {
        let stream_name = format!("KV_{}", spec.name);
        let mut stream = self
            .context
            .get_stream(stream_name.as_str())
            .await
            .map_err(|e| HiveError::Kv(e.to_string()))?;
        let mut config = stream
            .info()
            .await
            .map_err(|e| HiveError::Kv(e.to_string()))?
            .config
            .clone();
        if replicas <= config.num_replicas {
            return Ok(());
        }
        config.num_replicas = replicas;
        self.context
            .update_stream(config)
            .await
            .map_err(|e| HiveError::Kv(e.to_string()))?;
        info!("Raised {} replicas to {}", spec.name, replicas);
        Ok(())
    }
}

/// In-process provider for tests.
#[derive(Default)]
pub struct MemoryKv {
    buckets: StdMutex<HashMap<String, Arc<MemoryBucket>>>,
    replicas: StdMutex<HashMap<String, usize>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, name: &str) -> Option<Arc<MemoryBucket>> {
        self.buckets.lock().unwrap().get(name).cloned()
    }

    pub fn replicas(&self, name: &str) -> Option<usize> {
        self.replicas.lock().unwrap().get(name).copied()
    }

    /// Drop the bucket entirely, simulating the replicated stream being torn
    /// down during cluster formation.
    pub fn drop_bucket(&self, name: &str) {
        self.buckets.lock().unwrap().remove(name);
    }
}

#[derive(Default)]
pub struct MemoryBucket {
    entries: StdMutex<HashMap<String, Bytes>>,
    fail_streams: AtomicU32,
}

impl MemoryBucket {
    /// Make the next `n` operations fail with a stream-unavailable error.
    pub fn inject_stream_failures(&self, n: u32) {
        self.fail_streams.store(n, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<()> {
        let remaining = self.fail_streams.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_streams.store(remaining - 1, Ordering::SeqCst);
            return Err(HiveError::Kv("no responders available".to_string()));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvBucket for MemoryBucket {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.check_failure()?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_failure()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_failure()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_failure()?;
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }
}

#[async_trait]
impl KvProvider for MemoryKv {
    async fn open_bucket(&self, spec: &BucketSpec) -> Result<Arc<dyn KvBucket>> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(spec.name.clone())
            .or_insert_with(|| Arc::new(MemoryBucket::default()))
            .clone();
        self.replicas
            .lock()
            .unwrap()
            .entry(spec.name.clone())
            .or_insert(spec.replicas);
        Ok(bucket)
    }

    async fn update_replicas(&self, spec: &BucketSpec, replicas: usize) -> Result<()> {
        let mut map = self.replicas.lock().unwrap();
        let current = map.entry(spec.name.clone()).or_insert(spec.replicas);
        if replicas > *current {
            *current = replicas;
        }
        Ok(())
    }
}
