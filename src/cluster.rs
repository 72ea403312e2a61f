use crate::bus::{respond, subjects, MessageBus};
use crate::daemon::Daemon;
use crate::error::Result;
use crate::instance::VmStatus;
use crate::qemu::controller;
use crate::services::Services;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown phases, in coordinator order.
pub const PHASES: [&str; 5] = ["gate", "drain", "storage", "persist", "infra"];

/// Heartbeat envelope written to `heartbeat.<node>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub node: String,
    pub timestamp: i64,
    pub total_vcpu: u32,
    pub allocated_vcpu: u32,
    pub total_mem_gib: f64,
    pub allocated_mem_gib: f64,
    pub vm_count: usize,
}

/// Cluster-wide shutdown descriptor under `cluster.shutdown`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterShutdown {
    pub phase: String,
    pub force: bool,
    pub initiated_at: i64,
}

/// Node service manifest under `node.<id>.services`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceManifest {
    pub node: String,
    pub services: Vec<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownPhaseRequest {
    pub phase: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownAck {
    pub node: String,
    pub phase: String,
    #[serde(default)]
    pub stopped: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownProgress {
    pub node: String,
    pub phase: String,
    pub total: usize,
    pub remaining: usize,
}

/// Write the service manifest and raise KV replication to the cluster
/// size. Called once at startup.
pub async fn announce(daemon: &Arc<Daemon>) -> Result<()> {
    let manifest = ServiceManifest {
        node: daemon.node_id().to_string(),
        services: Services::manifest_names(),
        updated_at: chrono::Utc::now().timestamp(),
    };
    daemon.kv.write_services(daemon.node_id(), &manifest).await?;
    daemon.kv.update_replicas(daemon.config.cluster_size).await?;
    Ok(())
}

/// Periodic heartbeat into the cluster-state bucket.
pub fn spawn_heartbeat_publisher(daemon: Arc<Daemon>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stats = daemon.ledger.stats();
            let hb = Heartbeat {
                node: daemon.node_id().to_string(),
                timestamp: chrono::Utc::now().timestamp(),
                total_vcpu: stats.total_vcpu,
                allocated_vcpu: stats.allocated_vcpu,
                total_mem_gib: stats.total_mem_gib,
                allocated_mem_gib: stats.allocated_mem_gib,
                vm_count: daemon.registry.len().await,
            };
            if let Err(e) = daemon.kv.write_heartbeat(daemon.node_id(), &hb).await {
                warn!("Heartbeat write failed: {}", e);
            }
            tokio::time::sleep(daemon.config.heartbeat_interval).await;
        }
    })
}

async fn publish_ack(daemon: &Daemon, msg: &crate::bus::BusMessage, ack: &ShutdownAck) {
    if let Err(e) = respond(daemon.bus.as_ref(), msg, ack).await {
        warn!("Shutdown ack reply failed: {}", e);
    }
    if let Ok(payload) = serde_json::to_vec(ack) {
        let _ = daemon
            .bus
            .publish(subjects::SHUTDOWN_ACK, payload.into())
            .await;
    }
}

async fn publish_progress(daemon: &Daemon, phase: &str, total: usize, remaining: usize) {
    let progress = ShutdownProgress {
        node: daemon.node_id().to_string(),
        phase: phase.to_string(),
        total,
        remaining,
    };
    if let Ok(payload) = serde_json::to_vec(&progress) {
        let _ = daemon
            .bus
            .publish(subjects::SHUTDOWN_PROGRESS, payload.into())
            .await;
    }
}

/// Phase 1, GATE: stop the externally-facing processes and refuse new
/// work on this node.
async fn handle_gate(daemon: &Arc<Daemon>, msg: crate::bus::BusMessage) {
    info!("Cluster shutdown: gate");
    daemon.set_shutting_down();

    let descriptor = ClusterShutdown {
        phase: "gate".to_string(),
        force: false,
        initiated_at: chrono::Utc::now().timestamp(),
    };
    if let Err(e) = daemon.kv.write_cluster_shutdown(&descriptor).await {
        warn!("Writing cluster shutdown descriptor failed: {}", e);
    }

    let (stopped, error) = match daemon.services.processes.stop_gateway().await {
        Ok(stopped) => (stopped, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };

    publish_ack(
        daemon,
        &msg,
        &ShutdownAck {
            node: daemon.node_id().to_string(),
            phase: "gate".to_string(),
            stopped,
            error,
        },
    )
    .await;
}

/// Phase 2, DRAIN: stop every local VM, keeping volumes, then mark the
/// node cleanly shut down.
async fn handle_drain(daemon: &Arc<Daemon>, msg: crate::bus::BusMessage) {
    info!("Cluster shutdown: drain");
    daemon.set_shutting_down();

    let ids = daemon.registry.ids().await;
    let mut active = Vec::new();
    for id in ids {
        if daemon.registry.status_of(&id).await == Some(VmStatus::Running) {
            active.push(id);
        }
    }
    let total = active.len();
    publish_progress(daemon, "drain", total, total).await;

    for id in &active {
        if let Err(e) = daemon
            .registry
            .transition(&daemon.kv, id, VmStatus::Stopping)
            .await
        {
            warn!("Drain transition of {} failed: {}", id, e);
        }
    }
    controller::stop_instances(daemon, &active, false).await;
    for id in &active {
        if let Err(e) = daemon
            .registry
            .transition(&daemon.kv, id, VmStatus::Stopped)
            .await
        {
            warn!("Drain transition of {} to stopped failed: {}", id, e);
        }
        let _ = daemon
            .registry
            .with_vm(id, |vm| {
                vm.pid = None;
                vm.qmp = None;
            })
            .await;
    }
    publish_progress(daemon, "drain", total, 0).await;

    let mut error = None;
    if let Err(e) = daemon.kv.write_shutdown_marker(daemon.node_id()).await {
        error = Some(e.to_string());
        warn!("Writing shutdown marker failed: {}", e);
    }
    if let Err(e) = daemon.registry.persist(&daemon.kv).await {
        error = Some(e.to_string());
        warn!("Drain persist failed: {}", e);
    }

    publish_ack(
        daemon,
        &msg,
        &ShutdownAck {
            node: daemon.node_id().to_string(),
            phase: "drain".to_string(),
            stopped: active,
            error,
        },
    )
    .await;
}

/// Phase 3, STORAGE: stop the block daemon, sweep stray NBD servers.
async fn handle_storage(daemon: &Arc<Daemon>, msg: crate::bus::BusMessage) {
    info!("Cluster shutdown: storage");
    let mut error = None;
    if let Err(e) = daemon.services.processes.stop_block_daemon().await {
        error = Some(e.to_string());
    }
    match daemon.services.processes.kill_stray_nbd().await {
        Ok(0) => {}
        Ok(n) => info!("Killed {} stray NBD server(s)", n),
        Err(e) => warn!("NBD sweep failed: {}", e),
    }

    publish_ack(
        daemon,
        &msg,
        &ShutdownAck {
            node: daemon.node_id().to_string(),
            phase: "storage".to_string(),
            stopped: vec!["block-daemon".to_string()],
            error,
        },
    )
    .await;
}

/// Phase 4, PERSIST: stop the object store.
async fn handle_persist(daemon: &Arc<Daemon>, msg: crate::bus::BusMessage) {
    info!("Cluster shutdown: persist");
    let error = daemon
        .services
        .processes
        .stop_object_store()
        .await
        .err()
        .map(|e| e.to_string());

    publish_ack(
        daemon,
        &msg,
        &ShutdownAck {
            node: daemon.node_id().to_string(),
            phase: "persist".to_string(),
            stopped: vec!["object-store".to_string()],
            error,
        },
    )
    .await;
}

/// Phase 5, INFRA: drop every subscription and leave. No ack; the bus is
/// going down with us. Runs on a detached task: the teardown aborts the
/// phase handler task itself.
async fn handle_infra(daemon: &Arc<Daemon>) {
    info!("Cluster shutdown: infra");
    let daemon = daemon.clone();
    tokio::spawn(async move {
        daemon.unsubscribe_all().await;
        daemon.request_exit();
    });
}

/// Subscribe this node to all five phase topics.
pub async fn bind(daemon: &Arc<Daemon>) -> Result<()> {
    for phase in PHASES {
        let subject = subjects::cluster_shutdown(phase);
        let mut sub = daemon.bus.subscribe(&subject).await?;
        let worker = daemon.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                match phase {
                    "gate" => handle_gate(&worker, msg).await,
                    "drain" => handle_drain(&worker, msg).await,
                    "storage" => handle_storage(&worker, msg).await,
                    "persist" => handle_persist(&worker, msg).await,
                    "infra" => {
                        handle_infra(&worker).await;
                        return;
                    }
                    _ => {}
                }
            }
        });
        daemon.register_topic_task(task).await;
    }
    Ok(())
}

/// Drive the five phases from this node: publish each phase fan-out and
/// collect acks from `expected_nodes` daemons before moving on (INFRA gets
/// none). Nodes that miss the phase timeout are reported and skipped.
pub async fn coordinate_shutdown(
    bus: Arc<dyn MessageBus>,
    expected_nodes: usize,
    force: bool,
    phase_timeout: Duration,
) -> Result<Vec<ShutdownAck>> {
    let mut acks = Vec::new();
    let mut ack_sub = bus.subscribe(subjects::SHUTDOWN_ACK).await?;

    for phase in PHASES {
        let request = ShutdownPhaseRequest {
            phase: phase.to_string(),
            force,
            timeout_seconds: phase_timeout.as_secs(),
        };
        let payload = serde_json::to_vec(&request)?;
        bus.publish(&subjects::cluster_shutdown(phase), payload.into())
            .await?;
        info!("Shutdown phase {} published", phase);

        if phase == "infra" {
            break;
        }

        let deadline = tokio::time::Instant::now() + phase_timeout;
        let mut phase_acks = 0;
        while phase_acks < expected_nodes {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                error!(
                    "Phase {} timed out with {}/{} acks",
                    phase, phase_acks, expected_nodes
                );
                break;
            }
            match tokio::time::timeout(remaining, ack_sub.next()).await {
                Ok(Some(msg)) => {
                    if let Ok(ack) = serde_json::from_slice::<ShutdownAck>(&msg.payload) {
                        if ack.phase == phase {
                            phase_acks += 1;
                            acks.push(ack);
                        }
                    }
                }
                _ => break,
            }
        }
    }

    Ok(acks)
}

/// Signal-driven shutdown (SIGTERM/SIGINT). When a coordinated shutdown
/// already drained the node, only the teardown remains.
pub async fn shutdown_on_signal(daemon: &Arc<Daemon>) {
    if daemon.is_shutting_down() {
        info!("Signal during coordinated shutdown; instances already drained");
    } else {
        daemon.set_shutting_down();

        let ids = daemon.registry.ids().await;
        let mut active = Vec::new();
        for id in ids {
            if daemon.registry.status_of(&id).await == Some(VmStatus::Running) {
                active.push(id);
            }
        }
        info!("Stopping {} instance(s) before exit", active.len());

        for id in &active {
            if let Err(e) = daemon
                .registry
                .transition(&daemon.kv, id, VmStatus::Stopping)
                .await
            {
                warn!("Shutdown transition of {} failed: {}", id, e);
            }
        }
        controller::stop_instances(daemon, &active, false).await;
        for id in &active {
            let _ = daemon
                .registry
                .transition(&daemon.kv, id, VmStatus::Stopped)
                .await;
            let _ = daemon
                .registry
                .with_vm(id, |vm| {
                    vm.pid = None;
                    vm.qmp = None;
                })
                .await;
        }

        if let Err(e) = daemon.kv.write_shutdown_marker(daemon.node_id()).await {
            warn!("Writing shutdown marker failed: {}", e);
        }
        if let Err(e) = daemon.registry.persist(&daemon.kv).await {
            warn!("Final persist failed: {}", e);
        }
    }

    daemon.unsubscribe_all().await;
    daemon.request_exit();
}
