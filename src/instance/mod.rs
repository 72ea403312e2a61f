pub mod registry;
pub mod state;

pub use registry::{Registry, RegistrySnapshot};
pub use state::VmStatus;

use crate::qemu::qmp::QmpSession;
use crate::qemu::QemuSpec;
use crate::rpc::api::Ec2Instance;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Generate an opaque resource token: prefix plus 17 hex characters.
pub fn generate_token(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &hex[..17])
}

pub fn valid_instance_id(id: &str) -> bool {
    id.starts_with("i-") && id.len() > 2
}

/// One backing volume of a VM: the boot disk, the EFI-variables disk, the
/// cloud-init seed, or a hot-attached data volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EbsRequest {
    pub volume_id: String,
    pub device_name: String,
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
    #[serde(default)]
    pub size_gib: Option<u64>,
}

impl EbsRequest {
    pub fn data_volume(volume_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            device_name: device_name.into(),
            boot: false,
            efi: false,
            cloud_init: false,
            delete_on_termination: false,
            block_uri: None,
            size_gib: None,
        }
    }

    /// EFI and cloud-init disks are implementation details; boot and data
    /// volumes exist in the user's volume namespace.
    pub fn user_visible(&self) -> bool {
        !self.efi && !self.cloud_init
    }

    pub fn internal(&self) -> bool {
        self.boot || self.efi || self.cloud_init
    }
}

/// Operation flags last received for this VM.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceAttributes {
    pub start: bool,
    pub stop: bool,
    pub terminate: bool,
    pub attach: bool,
    pub detach: bool,
}

/// Crash bookkeeping consumed by the restart policy. Zero timestamps mean
/// "never".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CrashHealth {
    pub crash_count: u32,
    pub first_crash_time: i64,
    pub last_crash_time: i64,
    pub last_crash_reason: String,
    pub restart_count: u32,
}

mod ebs_list {
    use super::EbsRequest;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::sync::{Arc, Mutex};

    pub fn serialize<S: Serializer>(
        list: &Arc<Mutex<Vec<EbsRequest>>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        list.lock().unwrap().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Arc<Mutex<Vec<EbsRequest>>>, D::Error> {
        Vec::deserialize(deserializer).map(|v| Arc::new(Mutex::new(v)))
    }
}

/// The authoritative per-VM record. Runtime handles (PID, QMP client) are
/// not persisted; they are reconstructed on restart.
#[derive(Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub reservation_id: String,
    pub instance_type: String,
    pub image_id: String,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    pub status: VmStatus,
    #[serde(default)]
    pub attributes: InstanceAttributes,
    #[serde(default)]
    pub last_node: String,
    /// Ordered backing volumes. Own lock, nested inside the registry lock.
    #[serde(with = "ebs_list")]
    pub ebs_requests: Arc<Mutex<Vec<EbsRequest>>>,
    #[serde(default)]
    pub ec2: Option<Ec2Instance>,
    #[serde(default)]
    pub health: CrashHealth,
    /// Snapshot of the hypervisor command configuration, kept so a crashed
    /// or stopped VM can be relaunched identically.
    #[serde(default)]
    pub qemu: Option<QemuSpec>,
    #[serde(skip)]
    pub pid: Option<i32>,
    #[serde(skip)]
    pub qmp: Option<Arc<dyn QmpSession>>,
    #[serde(default)]
    pub created_at: i64,
}

impl std::fmt::Debug for VmRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRecord")
            .field("id", &self.id)
            .field("instance_type", &self.instance_type)
            .field("status", &self.status)
            .field("pid", &self.pid)
            .field("last_node", &self.last_node)
            .finish_non_exhaustive()
    }
}

impl VmRecord {
    pub fn new(
        id: impl Into<String>,
        reservation_id: impl Into<String>,
        instance_type: impl Into<String>,
        image_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            reservation_id: reservation_id.into(),
            instance_type: instance_type.into(),
            image_id: image_id.into(),
            key_name: None,
            user_data: None,
            status: VmStatus::Provisioning,
            attributes: InstanceAttributes::default(),
            last_node: String::new(),
            ebs_requests: Arc::new(Mutex::new(Vec::new())),
            ec2: None,
            health: CrashHealth::default(),
            qemu: None,
            pid: None,
            qmp: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Copy of the backing-volume list, taken under its own lock.
    pub fn ebs_snapshot(&self) -> Vec<EbsRequest> {
        self.ebs_requests.lock().unwrap().clone()
    }

    pub fn boot_volume(&self) -> Option<EbsRequest> {
        self.ebs_requests
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.boot)
            .cloned()
    }

    /// Set the status and mirror the EC2 state code/name onto the embedded
    /// instance object.
    pub fn apply_status(&mut self, status: VmStatus) {
        self.status = status;
        if let Some(ec2) = &mut self.ec2 {
            ec2.set_state(status);
        }
    }

    /// Device letters currently claimed on the /dev/sdX namespace.
    pub fn used_device_letters(&self) -> Vec<char> {
        self.ebs_requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| {
                e.device_name
                    .strip_prefix("/dev/sd")
                    .and_then(|s| s.chars().next())
            })
            .collect()
    }

    /// Replace the entry for the same volume id, or append.
    pub fn upsert_ebs(&self, req: EbsRequest) {
        let mut list = self.ebs_requests.lock().unwrap();
        if let Some(existing) = list.iter_mut().find(|e| e.volume_id == req.volume_id) {
            *existing = req;
        } else {
            list.push(req);
        }
    }

    pub fn remove_ebs(&self, volume_id: &str) -> Option<EbsRequest> {
        let mut list = self.ebs_requests.lock().unwrap();
        let idx = list.iter().position(|e| e.volume_id == volume_id)?;
        Some(list.remove(idx))
    }

    pub fn find_ebs(&self, volume_id: &str) -> Option<EbsRequest> {
        self.ebs_requests
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.volume_id == volume_id)
            .cloned()
    }
}
