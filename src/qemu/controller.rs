use crate::daemon::Daemon;
use crate::error::{HiveError, Result};
use crate::qemu::QemuSpec;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Grace given to the block daemon's NBD servers before the spawn.
const PRESPAWN_DELAY: Duration = Duration::from_secs(2);
/// A child that exits inside this window is a startup failure, not a crash.
const STARTUP_GRACE: Duration = Duration::from_secs(1);
const PIDFILE_WAIT: Duration = Duration::from_secs(60);
const PIDFILE_POLL: Duration = Duration::from_millis(500);

/// The hypervisor is first in line for the OOM killer; the daemon is
/// strongly protected.
const CHILD_OOM_SCORE_ADJ: i32 = 500;
pub const DAEMON_OOM_SCORE_ADJ: i32 = -500;

pub fn set_oom_score_adj(pid: i32, score: i32) -> std::io::Result<()> {
    std::fs::write(format!("/proc/{}/oom_score_adj", pid), score.to_string())
}

pub fn protect_daemon_from_oom() {
    if let Err(e) = std::fs::write("/proc/self/oom_score_adj", DAEMON_OOM_SCORE_ADJ.to_string()) {
        warn!("Adjusting daemon OOM score failed: {}", e);
    }
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

pub fn read_pid_file(path: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|e| HiveError::QemuFailed(format!("invalid pid file {}: {}", path.display(), e)))
}

/// Whether the pid file names a live process.
pub fn pid_file_live(path: &Path) -> bool {
    match read_pid_file(path) {
        Ok(pid) => pid_alive(pid),
        Err(_) => false,
    }
}

/// Spawn the hypervisor for one VM and supervise it.
///
/// Returns once startup is confirmed: a child that survives the grace
/// window with its pid file in place. Any later exit is handed to the
/// crash restarter by the supervision task.
pub async fn start_vm(daemon: &Arc<Daemon>, instance_id: &str, spec: &QemuSpec) -> Result<i32> {
    // The block daemon brings its NBD servers up asynchronously after
    // mount replies; give them a moment before QEMU opens the exports.
    tokio::time::sleep(PRESPAWN_DELAY).await;

    let args = spec.to_args();
    info!("Launching hypervisor for {}: {:?}", instance_id, args);

    let mut child = Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| HiveError::QemuFailed(format!("spawn {}: {}", args[0], e)))?;

    let pid = child
        .id()
        .ok_or_else(|| HiveError::QemuFailed("child exited before pid was known".to_string()))?
        as i32;

    if let Err(e) = set_oom_score_adj(pid, CHILD_OOM_SCORE_ADJ) {
        warn!("OOM score adjust for pid {} failed: {}", pid, e);
    }

    // Serial console discovery on stdout, diagnostics on stderr.
    let stdout = child.stdout.take();
    let (pts_tx, mut pts_rx) = oneshot::channel::<String>();
    if let Some(stdout) = stdout {
        tokio::spawn(scan_stdout(stdout, pts_tx));
    }

    let stderr_buf = Arc::new(StdMutex::new(String::new()));
    if let Some(stderr) = child.stderr.take() {
        let buf = stderr_buf.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.lock().unwrap().push_str(&line);
                buf.lock().unwrap().push('\n');
            }
        });
    }

    let confirmed = Arc::new(AtomicBool::new(false));
    let (early_tx, early_rx) = oneshot::channel();
    tokio::spawn(supervise(
        daemon.clone(),
        instance_id.to_string(),
        child,
        confirmed.clone(),
        early_tx,
    ));

    // Startup decision: an exit inside the grace window fails the launch;
    // surviving it marks every later exit as a runtime crash.
    tokio::select! {
        _ = tokio::time::sleep(STARTUP_GRACE) => {
            confirmed.store(true, Ordering::SeqCst);
        }
        exited = early_rx => {
            let stderr = stderr_buf.lock().unwrap().clone();
            let detail = match exited {
                Ok(status) => format!("{}", status),
                Err(_) => "unknown exit".to_string(),
            };
            return Err(HiveError::QemuFailed(format!(
                "hypervisor for {} exited during startup ({}): {}",
                instance_id, detail, stderr.trim()
            )));
        }
    }

    if !spec.pid_file.exists() {
        return Err(HiveError::QemuFailed(format!(
            "pid file {} missing after startup",
            spec.pid_file.display()
        )));
    }

    if let Ok(pts) = pts_rx.try_recv() {
        debug!("Instance {} serial console at {}", instance_id, pts);
    }

    info!("Hypervisor for {} running as pid {}", instance_id, pid);
    Ok(pid)
}

/// Drain stdout, reporting the first /dev/pts path (the serial console).
async fn scan_stdout(stdout: tokio::process::ChildStdout, pts_tx: oneshot::Sender<String>) {
    let mut pts_tx = Some(pts_tx);
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(idx) = line.find("/dev/pts/") {
            let pts: String = line[idx..]
                .chars()
                .take_while(|c| !c.is_whitespace())
                .collect();
            if let Some(tx) = pts_tx.take() {
                let _ = tx.send(pts);
            }
        }
    }
}

/// Single wait point for the child. Exits before startup confirmation are
/// reported back to the launcher; exits after it go to the crash restarter.
async fn supervise(
    daemon: Arc<Daemon>,
    instance_id: String,
    mut child: Child,
    confirmed: Arc<AtomicBool>,
    early_tx: oneshot::Sender<std::process::ExitStatus>,
) {
    match child.wait().await {
        Ok(status) => {
            if confirmed.load(Ordering::SeqCst) {
                crate::restart::handle_crash(daemon, instance_id, status).await;
            } else {
                let _ = early_tx.send(status);
            }
        }
        Err(e) => {
            error!("Waiting on hypervisor for {} failed: {}", instance_id, e);
        }
    }
}

/// Stop a set of VMs in parallel: best-effort ACPI powerdown, bounded wait
/// for the pid file, SIGKILL as a last resort, then volume teardown and
/// ledger release. Per-VM command subscriptions are cancelled only when the
/// VM is going away for good.
pub async fn stop_instances(daemon: &Arc<Daemon>, ids: &[String], delete_volume: bool) {
    let tasks: Vec<_> = ids
        .iter()
        .map(|id| stop_one(daemon, id.clone(), delete_volume))
        .collect();
    futures::future::join_all(tasks).await;

    if delete_volume {
        for id in ids {
            daemon.cancel_cmd_subscription(id).await;
        }
    }
}

async fn stop_one(daemon: &Arc<Daemon>, instance_id: String, delete_volume: bool) {
    let vm = match daemon.registry.get_clone(&instance_id).await {
        Some(vm) => vm,
        None => return,
    };

    // ACPI powerdown; the child may already be gone.
    if let Some(qmp) = &vm.qmp {
        if let Err(e) = crate::qemu::qmp::system_powerdown(qmp.as_ref()).await {
            debug!("Powerdown of {} failed (continuing): {}", instance_id, e);
        }
    }

    let pid_file = vm
        .qemu
        .as_ref()
        .map(|q| q.pid_file.clone())
        .unwrap_or_else(|| daemon.config.pid_file(&instance_id));

    let deadline = tokio::time::Instant::now() + PIDFILE_WAIT;
    while pid_file.exists() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(PIDFILE_POLL).await;
    }

    if pid_file.exists() {
        if let Ok(pid) = read_pid_file(&pid_file) {
            warn!("Instance {} did not power down, sending SIGKILL to {}", instance_id, pid);
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!("SIGKILL of {} failed: {}", pid, e);
            }
        }
        let _ = std::fs::remove_file(&pid_file);
    }

    // Tear down every backing volume mount and release the metadata.
    for req in vm.ebs_snapshot() {
        daemon.binder.unmount(&req.volume_id).await;
        if req.user_visible() {
            if let Err(e) = daemon.services.volumes.set_available(&req.volume_id).await {
                warn!("Marking {} available failed: {}", req.volume_id, e);
            }
        }

        if delete_volume {
            let delete = req.efi || req.cloud_init || req.delete_on_termination;
            if delete {
                daemon.binder.delete_backing(&req.volume_id).await;
                if req.user_visible() {
                    let _ = daemon.services.volumes.set_deleted(&req.volume_id).await;
                }
            }
        }
    }

    if let Err(e) = daemon.ledger.deallocate(&vm.instance_type).await {
        warn!("Deallocate of stopped {} failed: {}", instance_id, e);
    }

    info!("Instance {} stopped", instance_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        std::fs::write(&path, "4321\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), 4321);

        std::fs::write(&path, "not-a-pid").unwrap();
        assert!(read_pid_file(&path).is_err());
        assert!(read_pid_file(&dir.path().join("missing.pid")).is_err());
    }

    #[test]
    fn test_pid_file_live_for_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        assert!(pid_file_live(&path));

        // A pid that cannot exist.
        std::fs::write(&path, "-2").unwrap();
        assert!(!pid_file_live(&path));
    }
}
