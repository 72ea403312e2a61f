use crate::daemon::Daemon;
use crate::error::{HiveError, Result};
use crate::instance::VmStatus;
use crate::qemu::controller;
use crate::qemu::qmp::{self, QmpClient};
use crate::rpc::launch;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const READINESS_TIMEOUT: Duration = Duration::from_secs(120);
const READINESS_POLL: Duration = Duration::from_secs(2);
/// Settling time before touching state when the previous run crashed.
const CRASH_RECOVERY_DELAY: Duration = Duration::from_secs(3);
const RELAUNCH_CONCURRENCY: usize = 2;

/// Daemon-start reconciliation. Runs before any RPC subscription binds, so
/// no request observes a half-restored registry.
pub async fn run(daemon: &Arc<Daemon>) -> Result<()> {
    let node = daemon.node_id().to_string();

    // A marker means the previous run drained cleanly. Without one we are
    // recovering from a crash: wait out in-flight writes and validate PIDs
    // strictly before trusting them.
    let clean = match daemon.kv.shutdown_marker_exists(&node).await {
        Ok(found) => {
            if found {
                daemon.kv.delete_shutdown_marker(&node).await?;
            }
            found
        }
        Err(e) => {
            warn!("Shutdown marker check failed: {}", e);
            false
        }
    };
    if clean {
        info!("Clean restart of node {}", node);
    } else {
        info!("Crash recovery for node {}", node);
        tokio::time::sleep(CRASH_RECOVERY_DELAY).await;
    }

    wait_for_collaborators(daemon).await?;

    let snapshot = daemon.kv.load_state(&node).await?.unwrap_or_default();
    let count = snapshot.vms.len();
    daemon.registry.replace_all(snapshot).await;
    info!("Restored {} instance(s) from persisted state", count);

    let mut relaunch = Vec::new();
    for id in daemon.registry.ids().await {
        let vm = match daemon.registry.get_clone(&id).await {
            Some(vm) => vm,
            None => continue,
        };

        match vm.status {
            VmStatus::Terminated => continue,
            VmStatus::Stopped => {
                migrate_stopped(daemon, &id).await;
                continue;
            }
            _ => {}
        }

        if let Err(e) = daemon.ledger.allocate(&vm.instance_type).await {
            // An upgrade may have shrunk the catalog or the node; the VM is
            // still brought back, just without an accounted share.
            warn!("Re-allocating {} for {} failed: {}", vm.instance_type, id, e);
        }

        let pid_file = vm
            .qemu
            .as_ref()
            .map(|q| q.pid_file.clone())
            .unwrap_or_else(|| daemon.config.pid_file(&id));
        let live_pid = match controller::read_pid_file(&pid_file) {
            Ok(pid) if controller::pid_file_live(&pid_file) => {
                if clean || hypervisor_cmdline_matches(pid, daemon, &id) {
                    Some(pid)
                } else {
                    warn!("PID {} for {} is not our hypervisor, ignoring", pid, id);
                    None
                }
            }
            _ => None,
        };

        if let Some(pid) = live_pid {
            match reconnect_instance(daemon, &id, pid).await {
                Ok(()) => {
                    info!("Reconnected to live instance {} (pid {})", id, pid);
                    continue;
                }
                Err(e) => {
                    warn!("Reconnect to {} failed, relaunching: {}", id, e);
                }
            }
        }

        // The hypervisor is gone; reconcile the record with that reality.
        match vm.status {
            VmStatus::Stopping => {
                let _ = daemon.registry.force_status(&id, VmStatus::Stopped).await;
                if migrate_stopped(daemon, &id).await {
                    let _ = daemon.ledger.deallocate(&vm.instance_type).await;
                } else {
                    // Revert so the next restart retries the migration.
                    let _ = daemon.registry.force_status(&id, VmStatus::Stopping).await;
                }
            }
            VmStatus::ShuttingDown => {
                let _ = daemon.registry.force_status(&id, VmStatus::Terminated).await;
                let _ = daemon.ledger.deallocate(&vm.instance_type).await;
            }
            _ => {
                // Running and every other non-terminal state relaunch.
                let _ = daemon.registry.force_status(&id, VmStatus::Pending).await;
                relaunch.push(id);
            }
        }
    }

    // Relaunch with bounded concurrency so a node full of VMs comes back
    // without a thundering herd.
    if !relaunch.is_empty() {
        info!("Relaunching {} instance(s)", relaunch.len());
        let semaphore = Arc::new(Semaphore::new(RELAUNCH_CONCURRENCY));
        let mut tasks = Vec::new();
        for id in relaunch {
            let daemon = daemon.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                if let Err(e) = launch::launch_instance(&daemon, &id).await {
                    warn!("Recovery relaunch of {} failed: {}", id, e);
                    let _ = daemon
                        .registry
                        .transition(&daemon.kv, &id, VmStatus::Error)
                        .await;
                    if let Ok(ty) = daemon
                        .registry
                        .with_vm(&id, |vm| vm.instance_type.clone())
                        .await
                    {
                        let _ = daemon.ledger.deallocate(&ty).await;
                    }
                }
            }));
        }
        futures::future::join_all(tasks).await;
    }

    daemon.registry.persist(&daemon.kv).await?;
    info!("Recovery complete");
    Ok(())
}

/// Hand a stopped VM to the cluster: write `instance.<id>`, drop it from
/// the local registry. Returns whether the handoff fully succeeded.
async fn migrate_stopped(daemon: &Arc<Daemon>, id: &str) -> bool {
    let vm = match daemon.registry.get_clone(id).await {
        Some(mut vm) => {
            vm.last_node = daemon.node_id().to_string();
            vm.pid = None;
            vm.qmp = None;
            vm
        }
        None => return false,
    };

    match daemon.kv.write_stopped(id, &vm).await {
        Ok(()) => {
            daemon.registry.remove(id).await;
            info!("Migrated stopped instance {} to the cluster", id);
            true
        }
        Err(e) => {
            warn!("Migration of stopped {} failed, keeping local: {}", id, e);
            false
        }
    }
}

/// Attach to a hypervisor that survived the daemon restart: fresh QMP
/// client, command subscription, status forced to Running.
async fn reconnect_instance(daemon: &Arc<Daemon>, id: &str, pid: i32) -> Result<()> {
    let socket = daemon
        .registry
        .get_clone(id)
        .await
        .and_then(|vm| vm.qemu.map(|q| q.qmp_socket))
        .unwrap_or_else(|| daemon.config.qmp_socket(id));

    let qmp = QmpClient::connect(&socket).await?;

    daemon
        .registry
        .with_vm(id, |vm| {
            vm.pid = Some(pid);
            vm.qmp = Some(qmp.clone());
        })
        .await?;

    daemon.install_cmd_subscription(id).await?;
    daemon.registry.force_status(id, VmStatus::Running).await?;

    qmp::spawn_heartbeat(
        daemon.registry.clone(),
        id.to_string(),
        qmp,
        qmp::HEARTBEAT_INTERVAL,
    );
    Ok(())
}

/// After a crash the pid file may point at a recycled PID; only trust it
/// when /proc says it is a QEMU process driving our QMP socket.
fn hypervisor_cmdline_matches(pid: i32, daemon: &Arc<Daemon>, id: &str) -> bool {
    let cmdline = match std::fs::read_to_string(format!("/proc/{}/cmdline", pid)) {
        Ok(c) => c,
        Err(_) => return false,
    };
    let args: Vec<&str> = cmdline.split('\0').filter(|s| !s.is_empty()).collect();
    let Some(exe) = args.first() else {
        return false;
    };
    if !exe.contains("qemu-system") {
        return false;
    }
    let socket = daemon.config.qmp_socket(id);
    cmdline.contains(&*socket.to_string_lossy())
}

async fn wait_for_collaborators(daemon: &Arc<Daemon>) -> Result<()> {
    let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
    loop {
        let block = daemon.services.processes.block_daemon_ready().await;
        let store = daemon.services.processes.object_store_ready().await;
        if block && store {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(HiveError::Service(
                "block daemon or object store unreachable".to_string(),
            ));
        }
        info!("Waiting for collaborators (block={}, store={})", block, store);
        tokio::time::sleep(READINESS_POLL).await;
    }
}
