use crate::daemon::Daemon;
use crate::error::{HiveError, Result};
use crate::instance::VmStatus;
use crate::qemu::qmp::{self, QmpClient, QmpSession};
use crate::qemu::{controller, DriveSpec, QemuSpec};
use crate::volume::EbsMountRequest;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const QMP_CONNECT_ATTEMPTS: u32 = 10;
const QMP_CONNECT_DELAY: Duration = Duration::from_millis(200);

/// Full launch flow for a VM already present in the registry with its
/// ledger share allocated: prepare backing volumes, mount them, spawn the
/// hypervisor, attach QMP, and advance to Running.
pub async fn launch_instance(daemon: &Arc<Daemon>, instance_id: &str) -> Result<()> {
    let vm = daemon
        .registry
        .get_clone(instance_id)
        .await
        .ok_or_else(|| HiveError::InstanceNotFound(instance_id.to_string()))?;

    // Idempotent: relaunches find their backing volumes already in place.
    daemon.boot_builder.prepare(&vm, vec![]).await?;

    // Mount the internal volumes that go on the command line. Data
    // volumes are hot-plugged after boot instead.
    let requests: Vec<_> = vm
        .ebs_snapshot()
        .into_iter()
        .filter(|r| r.internal())
        .collect();
    let mut mounted: Vec<String> = Vec::new();
    for req in &requests {
        let mount = daemon
            .binder
            .mount(&EbsMountRequest {
                volume: req.volume_id.clone(),
                device: Some(req.device_name.clone()),
                boot: req.boot,
                efi: req.efi,
                cloud_init: req.cloud_init,
                delete_on_termination: req.delete_on_termination,
                block_uri: req.block_uri.clone(),
            })
            .await;

        match mount {
            Ok(reply) => {
                let uri = match reply.uri {
                    Some(uri) => uri,
                    None => {
                        rollback_mounts(daemon, &mounted).await;
                        return Err(HiveError::BlockStorage(format!(
                            "mount of {} returned no URI",
                            req.volume_id
                        )));
                    }
                };
                mounted.push(req.volume_id.clone());
                let volume_id = req.volume_id.clone();
                daemon
                    .registry
                    .with_vm(instance_id, |vm| {
                        let mut list = vm.ebs_requests.lock().unwrap();
                        if let Some(entry) = list.iter_mut().find(|e| e.volume_id == volume_id) {
                            entry.block_uri = Some(uri.clone());
                        }
                    })
                    .await?;
            }
            Err(e) => {
                warn!("Mount of {} failed, rolling back: {}", req.volume_id, e);
                rollback_mounts(daemon, &mounted).await;
                return Err(e);
            }
        }
    }

    for req in &requests {
        if req.user_visible() {
            if let Err(e) = daemon
                .services
                .volumes
                .set_in_use(&req.volume_id, instance_id, &req.device_name)
                .await
            {
                warn!("Marking {} in-use failed: {}", req.volume_id, e);
            }
        }
    }

    // Resolve the hypervisor command from the instance type.
    let ty = daemon
        .ledger
        .catalog()
        .get(&vm.instance_type)
        .ok_or_else(|| HiveError::UnknownInstanceType(vm.instance_type.clone()))?
        .clone();

    let with_uris = daemon
        .registry
        .get_clone(instance_id)
        .await
        .ok_or_else(|| HiveError::InstanceNotFound(instance_id.to_string()))?;
    let drives: Vec<DriveSpec> = with_uris
        .ebs_snapshot()
        .iter()
        .filter(|req| req.internal())
        .filter_map(|req| {
            req.block_uri
                .as_ref()
                .map(|uri| DriveSpec::from_request(req, uri.clone()))
        })
        .collect();

    let ssh_port = port_scanner::request_open_port()
        .ok_or_else(|| HiveError::QemuFailed("no free TCP port for SSH forwarding".to_string()))?;

    let kvm = QemuSpec::kvm_available();
    let spec = QemuSpec {
        name: instance_id.to_string(),
        machine: "q35".to_string(),
        architecture: ty.architecture.clone(),
        cpu_type: if kvm { "host" } else { "max" }.to_string(),
        enable_kvm: kvm,
        vcpus: ty.vcpus,
        memory_mib: ty.memory_mib,
        drives,
        ssh_port,
        qmp_socket: daemon.config.qmp_socket(instance_id),
        pid_file: daemon.config.pid_file(instance_id),
    };
    daemon
        .registry
        .with_vm(instance_id, |vm| vm.qemu = Some(spec.clone()))
        .await?;

    let pid = match controller::start_vm(daemon, instance_id, &spec).await {
        Ok(pid) => pid,
        Err(e) => {
            rollback_mounts(daemon, &mounted).await;
            return Err(e);
        }
    };

    let qmp: Arc<dyn QmpSession> = match connect_qmp(&spec.qmp_socket).await {
        Ok(qmp) => qmp,
        Err(e) => {
            warn!("QMP attach to {} failed, killing pid {}: {}", instance_id, pid, e);
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
            rollback_mounts(daemon, &mounted).await;
            return Err(e);
        }
    };

    let node = daemon.node_id().to_string();
    daemon
        .registry
        .with_vm(instance_id, |vm| {
            vm.pid = Some(pid);
            vm.qmp = Some(qmp.clone());
            vm.last_node = node;
            vm.attributes.stop = false;
            vm.attributes.start = false;
        })
        .await?;

    daemon.install_cmd_subscription(instance_id).await?;

    daemon
        .registry
        .transition(&daemon.kv, instance_id, VmStatus::Running)
        .await?;

    // Data volumes hot-plug through the same path a runtime attach uses,
    // keeping the device names they had before a stop or crash.
    let data_volumes: Vec<_> = with_uris
        .ebs_snapshot()
        .into_iter()
        .filter(|r| !r.internal())
        .collect();
    for req in data_volumes {
        let current = match daemon.registry.get_clone(instance_id).await {
            Some(vm) => vm,
            None => break,
        };
        match daemon
            .binder
            .attach(&current, qmp.as_ref(), &req.volume_id, Some(&req.device_name))
            .await
        {
            Ok(outcome) => {
                let volume_id = req.volume_id.clone();
                let device_name = outcome.device_name.clone();
                let block_uri = outcome.block_uri.clone();
                let _ = daemon
                    .registry
                    .with_vm(instance_id, move |vm| {
                        let mut list = vm.ebs_requests.lock().unwrap();
                        if let Some(entry) =
                            list.iter_mut().find(|e| e.volume_id == volume_id)
                        {
                            entry.device_name = device_name.clone();
                            entry.block_uri = Some(block_uri);
                        }
                        drop(list);
                        if let Some(ec2) = &mut vm.ec2 {
                            ec2.upsert_block_device(crate::rpc::api::BlockDeviceMapping {
                                device_name,
                                ebs: crate::rpc::api::EbsAttachment {
                                    volume_id,
                                    status: "attached".to_string(),
                                    delete_on_termination: false,
                                    attach_time: Some(chrono::Utc::now().to_rfc3339()),
                                },
                            });
                        }
                    })
                    .await;
                if let Err(e) = daemon
                    .services
                    .volumes
                    .set_in_use(&req.volume_id, instance_id, &outcome.device_name)
                    .await
                {
                    warn!("Marking {} in-use failed: {}", req.volume_id, e);
                }
            }
            Err(e) => {
                warn!(
                    "Hot-plug of data volume {} on {} failed: {}",
                    req.volume_id, instance_id, e
                );
            }
        }
    }
    if let Err(e) = daemon.registry.persist(&daemon.kv).await {
        warn!("Persist after data volume attach on {} failed: {}", instance_id, e);
    }

    qmp::spawn_heartbeat(
        daemon.registry.clone(),
        instance_id.to_string(),
        qmp,
        qmp::HEARTBEAT_INTERVAL,
    );

    info!("Instance {} is running (pid {})", instance_id, pid);
    Ok(())
}

async fn connect_qmp(socket: &Path) -> Result<Arc<QmpClient>> {
    let mut last_err = None;
    for _ in 0..QMP_CONNECT_ATTEMPTS {
        match QmpClient::connect(socket).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(QMP_CONNECT_DELAY).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| HiveError::QemuFailed("QMP connect failed".to_string())))
}

async fn rollback_mounts(daemon: &Arc<Daemon>, mounted: &[String]) {
    for volume_id in mounted {
        daemon.binder.unmount(volume_id).await;
    }
}
