use crate::error::{HiveError, Result};
use byte_unit::Byte;
use std::path::PathBuf;
use std::time::Duration;

/// Queue group shared by all nodes for load-balanced EC2 verbs.
pub const WORKER_QUEUE_GROUP: &str = "hive-workers";

/// Policy knobs for the crash restarter.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Window in which crashes are counted before the counters reset.
    pub restart_window: Duration,
    /// Crashes tolerated inside the window before the VM is left in Error.
    pub max_restarts_in_window: u32,
    /// First backoff step; doubles per restart.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restart_window: Duration::from_secs(600),
            max_restarts_in_window: 3,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(120),
        }
    }
}

/// Daemon configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Node identity, unique within the cluster.
    pub node_id: String,
    /// Message bus URL.
    pub nats_url: String,
    /// Number of nodes in the cluster; drives KV bucket replication.
    pub cluster_size: usize,
    /// Directory holding per-VM pid files and QMP sockets.
    pub run_dir: PathBuf,
    /// Override for the total vCPUs offered by this node (default: host count).
    pub vcpu_limit: Option<u32>,
    /// Override for the total memory offered by this node (default: host total).
    pub memory_limit_gib: Option<f64>,
    /// Delay between guest PCI removal and blockdev-del on detach.
    pub detach_delay: Duration,
    /// Cluster heartbeat publish interval.
    pub heartbeat_interval: Duration,
    pub restart_policy: RestartPolicy,
}

impl DaemonConfig {
    pub fn new(node_id: impl Into<String>, nats_url: impl Into<String>) -> Self {
        let run_dir = directories::ProjectDirs::from("", "", "hive")
            .map(|d| d.runtime_dir().unwrap_or(d.data_dir()).to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/var/run/hive"));

        Self {
            node_id: node_id.into(),
            nats_url: nats_url.into(),
            cluster_size: 1,
            run_dir,
            vcpu_limit: None,
            memory_limit_gib: None,
            detach_delay: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Parse a human memory size ("4GiB", "512MiB") into GiB.
    pub fn parse_memory_gib(s: &str) -> Result<f64> {
        let bytes = Byte::parse_str(s, true)
            .map_err(|e| HiveError::InvalidConfig(format!("invalid memory size '{}': {}", s, e)))?;
        Ok(bytes.as_u64() as f64 / (1024.0 * 1024.0 * 1024.0))
    }

    pub fn pid_file(&self, instance_id: &str) -> PathBuf {
        self.run_dir.join(format!("{}.pid", instance_id))
    }

    pub fn qmp_socket(&self, instance_id: &str) -> PathBuf {
        self.run_dir.join(format!("{}.qmp", instance_id))
    }
}
