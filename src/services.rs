//! Capability interfaces for the collaborating services (image catalog,
//! key pairs, volume metadata, block namespace, cloud-init packing,
//! process-managed daemons). The core consumes these through dynamic
//! dispatch and never introspects the backing implementation.
//!
//! The `Memory*` / `Null*` types are in-process implementations used by the
//! test suite and single-node development.

use crate::error::{HiveError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// AMI catalog lookups.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn exists(&self, image_id: &str) -> Result<bool>;

    /// Name of the image's source volume in the block namespace.
    async fn source_volume(&self, image_id: &str) -> Result<String>;
}

/// Key-pair lookups.
#[async_trait]
pub trait KeyPairService: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;
    async fn public_key(&self, name: &str) -> Result<Option<String>>;
}

/// EBS volume metadata in the object store: state plus attachment info.
#[async_trait]
pub trait VolumeMetadataService: Send + Sync {
    /// Current state (`available`, `in-use`, `creating`, `deleted`), or
    /// None for an unknown volume.
    async fn get_state(&self, volume_id: &str) -> Result<Option<String>>;
    async fn set_in_use(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;
    async fn set_available(&self, volume_id: &str) -> Result<()>;
    async fn set_deleted(&self, volume_id: &str) -> Result<()>;

    /// Register a newly generated volume as available.
    async fn register(&self, volume_id: &str, size_gib: u64) -> Result<()>;
}

/// An open volume in the object store's block namespace.
#[async_trait]
pub trait BlockVolume: Send {
    fn block_size(&self) -> usize;
    fn block_count(&self) -> u64;
    async fn read_block(&mut self, index: u64) -> Result<Vec<u8>>;
    async fn write_block(&mut self, index: u64, data: &[u8]) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;

    /// Flush, close, and remove local journal files.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait BlockVolumeFactory: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Open a volume, creating it at `size_bytes` if missing.
    async fn open(&self, name: &str, size_bytes: u64) -> Result<Box<dyn BlockVolume>>;
}

/// Packs rendered user-data and meta-data into a cloud-init seed ISO.
#[async_trait]
pub trait CloudInitBuilder: Send + Sync {
    async fn build_iso(&self, user_data: &str, meta_data: &str) -> Result<Vec<u8>>;
}

/// Opaque forwarding for the EC2 verbs served outside the core (volumes,
/// snapshots, tags, key pairs, VPC).
#[async_trait]
pub trait PassthroughService: Send + Sync {
    async fn handle(&self, verb: &str, payload: Value) -> Result<Value>;
}

/// Process-managed collaborators touched during coordinated shutdown.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Stop the externally-facing gateway and UI; returns what was stopped.
    async fn stop_gateway(&self) -> Result<Vec<String>>;
    async fn stop_block_daemon(&self) -> Result<()>;
    /// Best-effort kill of stray NBD server processes; returns the count.
    async fn kill_stray_nbd(&self) -> Result<u32>;
    async fn stop_object_store(&self) -> Result<()>;
    async fn block_daemon_ready(&self) -> bool;
    async fn object_store_ready(&self) -> bool;
}

/// The full service surface handed to the daemon.
#[derive(Clone)]
pub struct Services {
    pub images: Arc<dyn ImageService>,
    pub keys: Arc<dyn KeyPairService>,
    pub volumes: Arc<dyn VolumeMetadataService>,
    pub blocks: Arc<dyn BlockVolumeFactory>,
    pub cloud_init: Arc<dyn CloudInitBuilder>,
    pub passthrough: Arc<dyn PassthroughService>,
    pub processes: Arc<dyn ProcessControl>,
}

impl Services {
    /// Service names advertised in the node manifest.
    pub fn manifest_names() -> Vec<String> {
        ["ec2", "ebs", "s3", "keypairs", "tags", "snapshots", "vpc"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Fully in-memory service set.
    pub fn in_memory() -> Self {
        Self {
            images: Arc::new(MemoryImageService::default()),
            keys: Arc::new(MemoryKeyPairService::default()),
            volumes: Arc::new(MemoryVolumeService::default()),
            blocks: Arc::new(MemoryBlockFactory::default()),
            cloud_init: Arc::new(NullCloudInitBuilder),
            passthrough: Arc::new(NullPassthroughService),
            processes: Arc::new(NullProcessControl::default()),
        }
    }
}

// --- in-memory implementations ---

#[derive(Default)]
pub struct MemoryImageService {
    images: Mutex<HashMap<String, String>>,
}

impl MemoryImageService {
    pub fn insert(&self, image_id: &str, source_volume: &str) {
        self.images
            .lock()
            .unwrap()
            .insert(image_id.to_string(), source_volume.to_string());
    }
}

#[async_trait]
impl ImageService for MemoryImageService {
    async fn exists(&self, image_id: &str) -> Result<bool> {
        Ok(self.images.lock().unwrap().contains_key(image_id))
    }

    async fn source_volume(&self, image_id: &str) -> Result<String> {
        self.images
            .lock()
            .unwrap()
            .get(image_id)
            .cloned()
            .ok_or_else(|| HiveError::Service(format!("image {} not found", image_id)))
    }
}

#[derive(Default)]
pub struct MemoryKeyPairService {
    keys: Mutex<HashMap<String, String>>,
}

impl MemoryKeyPairService {
    pub fn insert(&self, name: &str, public_key: &str) {
        self.keys
            .lock()
            .unwrap()
            .insert(name.to_string(), public_key.to_string());
    }
}

#[async_trait]
impl KeyPairService for MemoryKeyPairService {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.keys.lock().unwrap().contains_key(name))
    }

    async fn public_key(&self, name: &str) -> Result<Option<String>> {
        Ok(self.keys.lock().unwrap().get(name).cloned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMeta {
    pub state: String,
    pub attachment: Option<(String, String)>,
    pub size_gib: u64,
}

#[derive(Default)]
pub struct MemoryVolumeService {
    volumes: Mutex<HashMap<String, VolumeMeta>>,
}

impl MemoryVolumeService {
    pub fn insert_available(&self, volume_id: &str, size_gib: u64) {
        self.volumes.lock().unwrap().insert(
            volume_id.to_string(),
            VolumeMeta {
                state: "available".to_string(),
                attachment: None,
                size_gib,
            },
        );
    }

    pub fn meta(&self, volume_id: &str) -> Option<VolumeMeta> {
        self.volumes.lock().unwrap().get(volume_id).cloned()
    }
}

#[async_trait]
impl VolumeMetadataService for MemoryVolumeService {
    async fn get_state(&self, volume_id: &str) -> Result<Option<String>> {
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .get(volume_id)
            .map(|m| m.state.clone()))
    }

    async fn set_in_use(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        let mut map = self.volumes.lock().unwrap();
        let meta = map
            .get_mut(volume_id)
            .ok_or_else(|| HiveError::VolumeNotFound(volume_id.to_string()))?;
        meta.state = "in-use".to_string();
        meta.attachment = Some((instance_id.to_string(), device.to_string()));
        Ok(())
    }

    async fn set_available(&self, volume_id: &str) -> Result<()> {
        let mut map = self.volumes.lock().unwrap();
        let meta = map
            .get_mut(volume_id)
            .ok_or_else(|| HiveError::VolumeNotFound(volume_id.to_string()))?;
        meta.state = "available".to_string();
        meta.attachment = None;
        Ok(())
    }

    async fn set_deleted(&self, volume_id: &str) -> Result<()> {
        let mut map = self.volumes.lock().unwrap();
        if let Some(meta) = map.get_mut(volume_id) {
            meta.state = "deleted".to_string();
            meta.attachment = None;
        }
        Ok(())
    }

    async fn register(&self, volume_id: &str, size_gib: u64) -> Result<()> {
        self.insert_available(volume_id, size_gib);
        Ok(())
    }
}

const MEMORY_BLOCK_SIZE: usize = 65536;

#[derive(Default)]
pub struct MemoryBlockFactory {
    volumes: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
}

impl MemoryBlockFactory {
    pub fn raw(&self, name: &str) -> Option<Vec<u8>> {
        self.volumes
            .lock()
            .unwrap()
            .get(name)
            .map(|v| v.lock().unwrap().clone())
    }

    pub fn preload(&self, name: &str, data: Vec<u8>) {
        self.volumes
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(Mutex::new(data)));
    }
}

pub struct MemoryBlockVolume {
    data: Arc<Mutex<Vec<u8>>>,
    flushes: u64,
}

impl MemoryBlockVolume {
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}

#[async_trait]
impl BlockVolume for MemoryBlockVolume {
    fn block_size(&self) -> usize {
        MEMORY_BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        let len = self.data.lock().unwrap().len();
        (len as u64).div_ceil(MEMORY_BLOCK_SIZE as u64)
    }

    async fn read_block(&mut self, index: u64) -> Result<Vec<u8>> {
        let data = self.data.lock().unwrap();
        let start = index as usize * MEMORY_BLOCK_SIZE;
        if start >= data.len() {
            return Ok(vec![0u8; MEMORY_BLOCK_SIZE]);
        }
        let end = (start + MEMORY_BLOCK_SIZE).min(data.len());
        let mut block = data[start..end].to_vec();
        block.resize(MEMORY_BLOCK_SIZE, 0);
        Ok(block)
    }

    async fn write_block(&mut self, index: u64, block: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = index as usize * MEMORY_BLOCK_SIZE;
        let end = start + block.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(block);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

#[async_trait]
impl BlockVolumeFactory for MemoryBlockFactory {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.volumes.lock().unwrap().contains_key(name))
    }

    async fn open(&self, name: &str, size_bytes: u64) -> Result<Box<dyn BlockVolume>> {
        let data = self
            .volumes
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(vec![0u8; size_bytes as usize])))
            .clone();
        Ok(Box::new(MemoryBlockVolume { data, flushes: 0 }))
    }
}

pub struct NullCloudInitBuilder;

#[async_trait]
impl CloudInitBuilder for NullCloudInitBuilder {
    async fn build_iso(&self, user_data: &str, meta_data: &str) -> Result<Vec<u8>> {
        // Minimal seed payload; a real builder emits ISO 9660.
        let mut out = b"cidata\n".to_vec();
        out.extend_from_slice(meta_data.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(user_data.as_bytes());
        Ok(out)
    }
}

pub struct NullPassthroughService;

#[async_trait]
impl PassthroughService for NullPassthroughService {
    async fn handle(&self, verb: &str, _payload: Value) -> Result<Value> {
        Err(HiveError::Service(format!("no backend for {}", verb)))
    }
}

#[derive(Default)]
pub struct NullProcessControl {
    pub gateway_stopped: Mutex<bool>,
    pub block_daemon_stopped: Mutex<bool>,
    pub object_store_stopped: Mutex<bool>,
}

#[async_trait]
impl ProcessControl for NullProcessControl {
    async fn stop_gateway(&self) -> Result<Vec<String>> {
        *self.gateway_stopped.lock().unwrap() = true;
        Ok(vec!["gateway".to_string(), "ui".to_string()])
    }

    async fn stop_block_daemon(&self) -> Result<()> {
        *self.block_daemon_stopped.lock().unwrap() = true;
        Ok(())
    }

    async fn kill_stray_nbd(&self) -> Result<u32> {
        Ok(0)
    }

    async fn stop_object_store(&self) -> Result<()> {
        *self.object_store_stopped.lock().unwrap() = true;
        Ok(())
    }

    async fn block_daemon_ready(&self) -> bool {
        !*self.block_daemon_stopped.lock().unwrap()
    }

    async fn object_store_ready(&self) -> bool {
        !*self.object_store_stopped.lock().unwrap()
    }
}
