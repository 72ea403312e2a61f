use crate::config::RestartPolicy;
use crate::daemon::Daemon;
use crate::instance::{CrashHealth, VmStatus};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Human-readable crash cause derived from the child's exit status.
pub fn classify_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signal) = status.signal() {
        return match signal {
            libc::SIGKILL => "oom-killed".to_string(),
            libc::SIGSEGV => "segfault".to_string(),
            libc::SIGABRT => "abort".to_string(),
            n => format!("signal-{}", n),
        };
    }
    if let Some(code) = status.code() {
        return format!("exit-{}", code);
    }
    "unknown".to_string()
}

/// Crash bookkeeping: bump the counters and stamp the cause.
pub fn record_crash(health: &mut CrashHealth, now: i64, reason: &str) {
    health.crash_count += 1;
    health.last_crash_time = now;
    health.last_crash_reason = reason.to_string();
    if health.first_crash_time == 0 {
        health.first_crash_time = now;
    }
}

#[derive(Debug, PartialEq)]
pub enum RestartDecision {
    Restart { backoff: Duration },
    LeaveInError { reason: String },
}

/// Restart policy. Crashes outside the window reset the counters; the
/// reset path sets crash_count back to 1, so the first crash after a quiet
/// window always proceeds.
pub fn evaluate_restart(
    health: &mut CrashHealth,
    now: i64,
    policy: &RestartPolicy,
    shutting_down: bool,
    can_allocate: bool,
) -> RestartDecision {
    if shutting_down {
        return RestartDecision::LeaveInError {
            reason: "cluster shutdown in progress".to_string(),
        };
    }

    if now - health.first_crash_time > policy.restart_window.as_secs() as i64 {
        health.crash_count = 1;
        health.restart_count = 0;
        health.first_crash_time = now;
    }

    if health.crash_count > policy.max_restarts_in_window {
        return RestartDecision::LeaveInError {
            reason: format!(
                "{} crashes within the restart window",
                health.crash_count
            ),
        };
    }

    if !can_allocate {
        return RestartDecision::LeaveInError {
            reason: "no capacity to relaunch".to_string(),
        };
    }

    let exp = health.restart_count.min(16);
    let backoff = policy
        .backoff_max
        .min(policy.backoff_base.saturating_mul(1 << exp));
    RestartDecision::Restart { backoff }
}

/// Entry point from the hypervisor supervision task: the child exited after
/// startup had been confirmed.
pub async fn handle_crash(daemon: Arc<Daemon>, instance_id: String, status: ExitStatus) {
    // The stop and terminate paths move the status off Running before the
    // child exits; only an unexpected exit is a crash.
    let vm_status = daemon.registry.status_of(&instance_id).await;
    if vm_status != Some(VmStatus::Running) || daemon.is_shutting_down() {
        return;
    }

    let reason = classify_exit(&status);
    warn!("Instance {} hypervisor exited: {}", instance_id, reason);

    if let Err(e) = daemon
        .registry
        .transition(&daemon.kv, &instance_id, VmStatus::Error)
        .await
    {
        error!("Transition of crashed {} to error failed: {}", instance_id, e);
    }

    let now = chrono::Utc::now().timestamp();
    let vm = daemon
        .registry
        .with_vm(&instance_id, |vm| {
            record_crash(&mut vm.health, now, &reason);
            vm.pid = None;
            vm.qmp = None;
            vm.attributes.start = false;
            vm.clone()
        })
        .await;
    let vm = match vm {
        Ok(vm) => vm,
        Err(e) => {
            error!("Crashed instance {} vanished: {}", instance_id, e);
            return;
        }
    };

    if let Err(e) = daemon.ledger.deallocate(&vm.instance_type).await {
        warn!("Deallocate after crash of {}: {}", instance_id, e);
    }

    let qmp_socket = daemon.config.qmp_socket(&instance_id);
    if qmp_socket.exists() {
        let _ = std::fs::remove_file(&qmp_socket);
    }

    daemon.binder.release_all(&vm).await;

    if let Err(e) = daemon.registry.persist(&daemon.kv).await {
        warn!("Persist after crash of {} failed: {}", instance_id, e);
    }

    let can_allocate = daemon
        .ledger
        .can_allocate_name(&vm.instance_type, 1)
        .map(|n| n >= 1)
        .unwrap_or(false);

    let decision = daemon
        .registry
        .with_vm(&instance_id, |vm| {
            evaluate_restart(
                &mut vm.health,
                now,
                &daemon.config.restart_policy,
                daemon.is_shutting_down(),
                can_allocate,
            )
        })
        .await;

    match decision {
        Ok(RestartDecision::Restart { backoff }) => {
            info!(
                "Scheduling restart of {} in {:?} after {}",
                instance_id, backoff, reason
            );
            schedule_restart(daemon, instance_id, backoff);
        }
        Ok(RestartDecision::LeaveInError { reason }) => {
            warn!("Leaving {} in error: {}", instance_id, reason);
        }
        Err(e) => {
            error!("Restart evaluation for {} failed: {}", instance_id, e);
        }
    }
}

/// One-shot delayed relaunch. Conditions are re-checked after the backoff
/// because a stop, terminate, or cluster shutdown may have raced the timer.
fn schedule_restart(daemon: Arc<Daemon>, instance_id: String, backoff: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;

        if daemon.is_shutting_down() {
            return;
        }
        if daemon.registry.status_of(&instance_id).await != Some(VmStatus::Error) {
            return;
        }

        let bumped = daemon
            .registry
            .with_vm(&instance_id, |vm| {
                vm.health.restart_count += 1;
                vm.health.restart_count
            })
            .await;
        let attempt = match bumped {
            Ok(n) => n,
            Err(_) => return,
        };

        if let Err(e) = daemon
            .registry
            .transition(&daemon.kv, &instance_id, VmStatus::Pending)
            .await
        {
            error!("Restart transition for {} failed: {}", instance_id, e);
            return;
        }

        info!("Restarting {} (attempt {})", instance_id, attempt);
        if let Err(e) = crate::rpc::launch::launch_instance(&daemon, &instance_id).await {
            error!("Restart launch of {} failed: {}", instance_id, e);
            if let Err(e2) = daemon
                .registry
                .transition(&daemon.kv, &instance_id, VmStatus::Error)
                .await
            {
                error!("Post-failure transition for {} failed: {}", instance_id, e2);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn policy() -> RestartPolicy {
        RestartPolicy::default()
    }

    #[test]
    fn test_classify_signals() {
        assert_eq!(classify_exit(&ExitStatus::from_raw(9)), "oom-killed");
        assert_eq!(classify_exit(&ExitStatus::from_raw(11)), "segfault");
        assert_eq!(classify_exit(&ExitStatus::from_raw(6)), "abort");
        assert_eq!(classify_exit(&ExitStatus::from_raw(15)), "signal-15");
        assert_eq!(classify_exit(&ExitStatus::from_raw(0)), "exit-0");
        assert_eq!(classify_exit(&ExitStatus::from_raw(1 << 8)), "exit-1");
    }

    #[test]
    fn test_record_crash_sets_first_time_once() {
        let mut health = CrashHealth::default();
        record_crash(&mut health, 1000, "segfault");
        assert_eq!(health.crash_count, 1);
        assert_eq!(health.first_crash_time, 1000);

        record_crash(&mut health, 1060, "oom-killed");
        assert_eq!(health.crash_count, 2);
        assert_eq!(health.first_crash_time, 1000);
        assert_eq!(health.last_crash_time, 1060);
        assert_eq!(health.last_crash_reason, "oom-killed");
    }

    #[test]
    fn test_fourth_crash_in_window_not_restarted() {
        let mut health = CrashHealth::default();
        let mut now = 1000;
        for _ in 0..3 {
            record_crash(&mut health, now, "segfault");
            let decision = evaluate_restart(&mut health, now, &policy(), false, true);
            assert!(matches!(decision, RestartDecision::Restart { .. }));
            health.restart_count += 1;
            now += 60;
        }

        record_crash(&mut health, now, "segfault");
        let decision = evaluate_restart(&mut health, now, &policy(), false, true);
        assert!(matches!(decision, RestartDecision::LeaveInError { .. }));
    }

    #[test]
    fn test_quiet_window_resets_counters() {
        let mut health = CrashHealth::default();
        let mut now = 1000;
        for _ in 0..3 {
            record_crash(&mut health, now, "segfault");
            evaluate_restart(&mut health, now, &policy(), false, true);
            health.restart_count += 1;
            now += 30;
        }

        // Eleven quiet minutes, then another crash: counters reset and the
        // restart proceeds with a fresh backoff.
        now += 11 * 60;
        record_crash(&mut health, now, "segfault");
        let decision = evaluate_restart(&mut health, now, &policy(), false, true);
        assert_eq!(
            decision,
            RestartDecision::Restart {
                backoff: Duration::from_secs(5)
            }
        );
        assert_eq!(health.crash_count, 1);
        assert_eq!(health.restart_count, 0);
        assert_eq!(health.first_crash_time, now);
    }

    #[test]
    fn test_no_restart_during_cluster_shutdown() {
        let mut health = CrashHealth::default();
        record_crash(&mut health, 1000, "oom-killed");
        let decision = evaluate_restart(&mut health, 1000, &policy(), true, true);
        assert!(matches!(decision, RestartDecision::LeaveInError { .. }));
    }

    #[test]
    fn test_no_restart_without_capacity() {
        let mut health = CrashHealth::default();
        record_crash(&mut health, 1000, "oom-killed");
        let decision = evaluate_restart(&mut health, 1000, &policy(), false, false);
        assert!(matches!(decision, RestartDecision::LeaveInError { .. }));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        let mut health = CrashHealth::default();

        for (restarts, expected_secs) in [(0u32, 5u64), (1, 10), (2, 20), (5, 120), (10, 120)] {
            health.crash_count = 1;
            health.restart_count = restarts;
            health.first_crash_time = 1000;
            let decision = evaluate_restart(&mut health, 1000, &p, false, true);
            assert_eq!(
                decision,
                RestartDecision::Restart {
                    backoff: Duration::from_secs(expected_secs)
                },
                "restart_count {}",
                restarts
            );
        }
    }
}
