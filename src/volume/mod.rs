pub mod boot;

use crate::bus::{self, subjects, MessageBus};
use crate::error::{HiveError, Result};
use crate::instance::VmRecord;
use crate::qemu::qmp::{self, QmpSession};
use crate::services::VolumeMetadataService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Device letters offered for hot-plugged data volumes. Each maps to a
/// PCIe root port: 'f' -> hotplug1 .. 'p' -> hotplug11.
pub const HOTPLUG_LETTERS: &[char] = &['f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p'];

pub const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Locator for a network block device served by the storage daemon, either
/// over a local unix socket or TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockUri {
    Tcp {
        host: String,
        port: u16,
        export: String,
    },
    Unix {
        socket: String,
        export: String,
    },
}

impl BlockUri {
    /// Accepts `nbd://host:port/export` and
    /// `nbd+unix:///export?socket=/path`.
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("nbd+unix:///") {
            let (export, query) = rest
                .split_once('?')
                .ok_or_else(|| HiveError::BlockStorage(format!("missing socket in '{}'", uri)))?;
            let socket = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("socket="))
                .ok_or_else(|| HiveError::BlockStorage(format!("missing socket in '{}'", uri)))?;
            if export.is_empty() {
                return Err(HiveError::BlockStorage(format!("missing export in '{}'", uri)));
            }
            return Ok(BlockUri::Unix {
                socket: socket.to_string(),
                export: export.to_string(),
            });
        }

        if let Some(rest) = uri.strip_prefix("nbd://") {
            let (addr, export) = rest
                .split_once('/')
                .ok_or_else(|| HiveError::BlockStorage(format!("missing export in '{}'", uri)))?;
            let (host, port) = addr
                .split_once(':')
                .ok_or_else(|| HiveError::BlockStorage(format!("missing port in '{}'", uri)))?;
            let port: u16 = port
                .parse()
                .map_err(|_| HiveError::BlockStorage(format!("bad port in '{}'", uri)))?;
            if export.is_empty() {
                return Err(HiveError::BlockStorage(format!("missing export in '{}'", uri)));
            }
            return Ok(BlockUri::Tcp {
                host: host.to_string(),
                port,
                export: export.to_string(),
            });
        }

        Err(HiveError::BlockStorage(format!(
            "unsupported block URI '{}'",
            uri
        )))
    }

    pub fn export(&self) -> &str {
        match self {
            BlockUri::Tcp { export, .. } => export,
            BlockUri::Unix { export, .. } => export,
        }
    }

    /// `file=` value for a QEMU `-drive` argument.
    pub fn qemu_drive_file(&self) -> String {
        match self {
            BlockUri::Tcp { host, port, export } => {
                format!("nbd:{}:{}:exportname={}", host, port, export)
            }
            BlockUri::Unix { socket, export } => {
                format!("nbd:unix:{}:exportname={}", socket, export)
            }
        }
    }

    /// `server` object for a QMP `blockdev-add` with the nbd driver.
    pub fn qmp_server(&self) -> serde_json::Value {
        match self {
            BlockUri::Tcp { host, port, .. } => serde_json::json!({
                "type": "inet",
                "host": host,
                "port": port.to_string(),
            }),
            BlockUri::Unix { socket, .. } => serde_json::json!({
                "type": "unix",
                "path": socket,
            }),
        }
    }
}

/// Request to the block daemon's per-node mount/unmount topics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EbsMountRequest {
    pub volume: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub efi: bool,
    #[serde(default)]
    pub cloud_init: bool,
    #[serde(default)]
    pub delete_on_termination: bool,
    #[serde(default)]
    pub block_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EbsMountReply {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub mounted: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EbsDeleteRequest {
    pub volume: String,
}

pub fn node_name(volume_id: &str) -> String {
    format!("nbd-{}", volume_id)
}

pub fn device_id(volume_id: &str) -> String {
    format!("vdisk-{}", volume_id)
}

/// PCIe root port for a device letter: 'f' -> hotplug1 ... 'p' -> hotplug11.
pub fn hotplug_bus(letter: char) -> Result<String> {
    let idx = HOTPLUG_LETTERS
        .iter()
        .position(|&c| c == letter)
        .ok_or(HiveError::NoDeviceSlots)?;
    Ok(format!("hotplug{}", idx + 1))
}

/// Pick the first free guest device letter in /dev/sd[f-p].
pub fn next_device_letter(used: &[char]) -> Result<char> {
    HOTPLUG_LETTERS
        .iter()
        .copied()
        .find(|c| !used.contains(c))
        .ok_or(HiveError::NoDeviceSlots)
}

/// Hot-plug protocol against the block daemon and QMP.
pub struct VolumeBinder {
    bus: Arc<dyn MessageBus>,
    volumes: Arc<dyn VolumeMetadataService>,
    node_id: String,
    detach_delay: Duration,
}

#[derive(Debug)]
pub struct AttachOutcome {
    pub device_name: String,
    pub block_uri: String,
}

impl VolumeBinder {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        volumes: Arc<dyn VolumeMetadataService>,
        node_id: impl Into<String>,
        detach_delay: Duration,
    ) -> Self {
        Self {
            bus,
            volumes,
            node_id: node_id.into(),
            detach_delay,
        }
    }

    /// Ask the block daemon to mount a volume on this node.
    pub async fn mount(&self, req: &EbsMountRequest) -> Result<EbsMountReply> {
        let reply: EbsMountReply = bus::request_json(
            self.bus.as_ref(),
            &subjects::ebs_mount(&self.node_id),
            req,
            MOUNT_TIMEOUT,
        )
        .await?;
        if let Some(err) = &reply.error {
            return Err(HiveError::BlockStorage(err.clone()));
        }
        Ok(reply)
    }

    /// Best-effort unmount; failures are logged, not surfaced.
    pub async fn unmount(&self, volume_id: &str) {
        let req = EbsMountRequest {
            volume: volume_id.to_string(),
            ..Default::default()
        };
        let result: Result<EbsMountReply> = bus::request_json(
            self.bus.as_ref(),
            &subjects::ebs_unmount(&self.node_id),
            &req,
            MOUNT_TIMEOUT,
        )
        .await;
        if let Err(e) = result {
            warn!("Unmount of {} failed: {}", volume_id, e);
        }
    }

    /// Unmount that surfaces failure, for the attach rollback path.
    async fn unmount_checked(&self, volume_id: &str) -> Result<()> {
        let req = EbsMountRequest {
            volume: volume_id.to_string(),
            ..Default::default()
        };
        let reply: EbsMountReply = bus::request_json(
            self.bus.as_ref(),
            &subjects::ebs_unmount(&self.node_id),
            &req,
            MOUNT_TIMEOUT,
        )
        .await?;
        if let Some(err) = reply.error {
            return Err(HiveError::BlockStorage(err));
        }
        Ok(())
    }

    /// Best-effort delete of a volume's backing store.
    pub async fn delete_backing(&self, volume_id: &str) {
        let req = EbsDeleteRequest {
            volume: volume_id.to_string(),
        };
        let result: Result<serde_json::Value> = bus::request_json(
            self.bus.as_ref(),
            subjects::EBS_DELETE,
            &req,
            DELETE_TIMEOUT,
        )
        .await;
        if let Err(e) = result {
            warn!("Delete of volume {} failed: {}", volume_id, e);
        }
    }

    /// Three-phase attach: block-daemon mount, QMP blockdev-add, QMP
    /// device_add. Later-phase failures roll the earlier phases back.
    pub async fn attach(
        &self,
        vm: &VmRecord,
        qmp: &dyn QmpSession,
        volume_id: &str,
        requested_device: Option<&str>,
    ) -> Result<AttachOutcome> {
        let meta = self
            .volumes
            .get_state(volume_id)
            .await?
            .ok_or_else(|| HiveError::VolumeNotFound(volume_id.to_string()))?;
        if meta != "available" {
            return Err(HiveError::VolumeInUse(volume_id.to_string()));
        }

        // Phase 1: mount on this node.
        let mount = self
            .mount(&EbsMountRequest {
                volume: volume_id.to_string(),
                device: requested_device.map(|s| s.to_string()),
                ..Default::default()
            })
            .await?;
        let uri_str = mount
            .uri
            .ok_or_else(|| HiveError::BlockStorage("mount reply carried no URI".to_string()))?;
        let uri = match BlockUri::parse(&uri_str) {
            Ok(u) => u,
            Err(e) => {
                self.unmount(volume_id).await;
                return Err(e);
            }
        };

        // Phase 2: expose the NBD export to the hypervisor.
        let node = node_name(volume_id);
        if let Err(e) = qmp::blockdev_add_nbd(qmp, &node, &uri).await {
            warn!("blockdev-add for {} failed, unmounting: {}", volume_id, e);
            if let Err(e2) = self.unmount_checked(volume_id).await {
                warn!("Rollback unmount of {} failed: {}", volume_id, e2);
            }
            return Err(e);
        }

        // Phase 3: hot-plug into the guest on a free slot. The volume's own
        // previous entry does not count as an occupied letter, so a
        // re-attach after stop/start keeps its device name.
        let used: Vec<char> = {
            let list = vm.ebs_requests.lock().unwrap();
            list.iter()
                .filter(|e| e.volume_id != volume_id)
                .filter_map(|e| {
                    e.device_name
                        .strip_prefix("/dev/sd")
                        .and_then(|s| s.chars().next())
                })
                .collect()
        };
        let letter = match requested_device
            .and_then(|d| d.strip_prefix("/dev/sd"))
            .and_then(|s| s.chars().next())
            .filter(|c| HOTPLUG_LETTERS.contains(c) && !used.contains(c))
        {
            Some(c) => c,
            None => next_device_letter(&used)?,
        };
        let bus_name = hotplug_bus(letter)?;
        let dev_id = device_id(volume_id);

        if let Err(e) = qmp::device_add_disk(qmp, &dev_id, &node, &bus_name).await {
            warn!("device_add for {} failed, rolling back: {}", volume_id, e);
            match qmp::blockdev_del(qmp, &node).await {
                Ok(()) => {
                    if let Err(e2) = self.unmount_checked(volume_id).await {
                        warn!("Rollback unmount of {} failed: {}", volume_id, e2);
                    }
                }
                // The hypervisor still references the block node; tearing
                // down the mount underneath it would crash the guest.
                Err(del_err) => {
                    error!(
                        "blockdev-del rollback for {} failed, leaving mount in place: {}",
                        volume_id, del_err
                    );
                }
            }
            return Err(e);
        }

        let device_name = format!("/dev/sd{}", letter);
        info!(
            "Attached {} to {} as {} on {}",
            volume_id, vm.id, device_name, bus_name
        );
        Ok(AttachOutcome {
            device_name,
            block_uri: uri_str,
        })
    }

    /// Three-phase detach, reverse order of attach. Boot, EFI, and
    /// cloud-init volumes are refused.
    pub async fn detach(
        &self,
        vm: &VmRecord,
        qmp: &dyn QmpSession,
        volume_id: &str,
        force: bool,
    ) -> Result<()> {
        let entry = vm
            .find_ebs(volume_id)
            .ok_or_else(|| HiveError::VolumeNotFound(volume_id.to_string()))?;
        if entry.internal() {
            return Err(HiveError::NotPermitted(format!(
                "volume {} is a boot, EFI, or cloud-init volume",
                volume_id
            )));
        }

        // Phase 1: remove the guest device.
        let dev_id = device_id(volume_id);
        if let Err(e) = qmp::device_del(qmp, &dev_id).await {
            if !force {
                return Err(e);
            }
            warn!("device_del of {} failed, continuing (force): {}", dev_id, e);
        }

        // Phase 2: wait for the guest to acknowledge PCI removal, then drop
        // the block node. On failure the node is still referenced by the
        // hypervisor, so neither state nor the mount is touched.
        if !self.detach_delay.is_zero() {
            tokio::time::sleep(self.detach_delay).await;
        }
        qmp::blockdev_del(qmp, &node_name(volume_id)).await?;

        // Phase 3: best-effort unmount.
        self.unmount(volume_id).await;

        info!("Detached {} from {}", volume_id, vm.id);
        Ok(())
    }

    /// Flush a volume's backing store; failure is a warning only.
    pub async fn sync(&self, volume_id: &str) {
        let req = EbsMountRequest {
            volume: volume_id.to_string(),
            ..Default::default()
        };
        let result: Result<serde_json::Value> = bus::request_json(
            self.bus.as_ref(),
            &subjects::ebs_sync(&self.node_id),
            &req,
            SYNC_TIMEOUT,
        )
        .await;
        if let Err(e) = result {
            warn!("Sync of {} failed: {}", volume_id, e);
        }
    }

    /// Cleanup after a VM stops or crashes: unmount every attached volume
    /// and mark the user-visible ones available.
    pub async fn release_all(&self, vm: &VmRecord) {
        for req in vm.ebs_snapshot() {
            self.unmount(&req.volume_id).await;
            if req.user_visible() {
                if let Err(e) = self.volumes.set_available(&req.volume_id).await {
                    warn!("Marking {} available failed: {}", req.volume_id, e);
                }
            }
        }
    }
}
