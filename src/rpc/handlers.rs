use crate::bus::{respond, BusMessage};
use crate::daemon::Daemon;
use crate::error::{ApiError, ApiErrorCode, HiveError};
use crate::instance::{
    generate_token, valid_instance_id, EbsRequest, VmRecord, VmStatus,
};
use crate::qemu::controller;
use crate::rpc::api::*;
use crate::rpc::launch;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

const OWNER_ID: &str = "hive";

fn parse<T: DeserializeOwned>(msg: &BusMessage) -> Result<T, ApiError> {
    serde_json::from_slice(&msg.payload)
        .map_err(|e| ApiError::new(ApiErrorCode::InvalidParameterValue, e.to_string()))
}

async fn reply_ok<T: serde::Serialize>(daemon: &Daemon, msg: &BusMessage, body: &T) {
    if let Err(e) = respond(daemon.bus.as_ref(), msg, body).await {
        warn!("Reply on {} failed: {}", msg.subject, e);
    }
}

async fn reply_err(daemon: &Daemon, msg: &BusMessage, err: ApiError) {
    if let Err(e) = respond(daemon.bus.as_ref(), msg, &err).await {
        warn!("Error reply on {} failed: {}", msg.subject, e);
    }
}

/// Group instances into their reservations for the Describe verbs.
fn reservations_of(vms: Vec<VmRecord>) -> Vec<Reservation> {
    let mut by_reservation: std::collections::HashMap<String, Vec<Ec2Instance>> =
        std::collections::HashMap::new();
    for vm in vms {
        if let Some(ec2) = vm.ec2.clone() {
            by_reservation
                .entry(vm.reservation_id.clone())
                .or_default()
                .push(ec2);
        }
    }
    let mut out: Vec<Reservation> = by_reservation
        .into_iter()
        .map(|(reservation_id, instances)| Reservation {
            reservation_id,
            owner_id: OWNER_ID.to_string(),
            instances,
        })
        .collect();
    out.sort_by(|a, b| a.reservation_id.cmp(&b.reservation_id));
    out
}

// --- RunInstances ---

pub async fn handle_run_instances(daemon: &Arc<Daemon>, instance_type: &str, msg: BusMessage) {
    let input: RunInstancesInput = match parse(&msg) {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, &msg, e).await,
    };

    if daemon.is_shutting_down() {
        return reply_err(
            daemon,
            &msg,
            ApiError::server_internal("node is shutting down"),
        )
        .await;
    }

    // Validation happens before any allocation or side effect.
    if input.image_id.is_empty() {
        return reply_err(
            daemon,
            &msg,
            ApiError::new(ApiErrorCode::MissingParameter, "ImageId is required"),
        )
        .await;
    }
    if input.min_count < 1 || input.max_count < input.min_count {
        return reply_err(
            daemon,
            &msg,
            ApiError::new(
                ApiErrorCode::InvalidParameterValue,
                "MinCount must be >= 1 and <= MaxCount",
            ),
        )
        .await;
    }

    let type_name = if input.instance_type.is_empty() {
        instance_type.to_string()
    } else {
        input.instance_type.clone()
    };
    let ty = match daemon.ledger.catalog().get(&type_name) {
        Some(ty) => ty.clone(),
        None => {
            return reply_err(
                daemon,
                &msg,
                ApiError::new(
                    ApiErrorCode::InvalidInstanceType,
                    format!("The instance type '{}' does not exist", type_name),
                ),
            )
            .await
        }
    };

    match daemon.services.images.exists(&input.image_id).await {
        Ok(true) => {}
        Ok(false) => {
            return reply_err(
                daemon,
                &msg,
                ApiError::new(
                    ApiErrorCode::InvalidAmiIdNotFound,
                    format!("The image id '{}' does not exist", input.image_id),
                ),
            )
            .await
        }
        Err(e) => return reply_err(daemon, &msg, ApiError::server_internal(e.to_string())).await,
    }

    if let Some(key_name) = &input.key_name {
        match daemon.services.keys.exists(key_name).await {
            Ok(true) => {}
            Ok(false) => {
                return reply_err(
                    daemon,
                    &msg,
                    ApiError::new(
                        ApiErrorCode::InvalidKeyPairNotFound,
                        format!("The key pair '{}' does not exist", key_name),
                    ),
                )
                .await
            }
            Err(e) => {
                return reply_err(daemon, &msg, ApiError::server_internal(e.to_string())).await
            }
        }
    }

    // Up-front allocation for the whole MinCount..MaxCount range. Below
    // MinCount everything is rolled back.
    let fits = daemon.ledger.can_allocate(&ty, input.max_count);
    if fits < input.min_count {
        return reply_err(
            daemon,
            &msg,
            ApiError::new(
                ApiErrorCode::InsufficientInstanceCapacity,
                format!(
                    "Requested at least {} x {}, capacity for {}",
                    input.min_count, type_name, fits
                ),
            ),
        )
        .await;
    }

    let mut allocated: u64 = 0;
    for _ in 0..fits {
        match daemon.ledger.allocate(&type_name).await {
            Ok(()) => allocated += 1,
            Err(_) => break,
        }
    }
    if allocated < input.min_count {
        for _ in 0..allocated {
            let _ = daemon.ledger.deallocate(&type_name).await;
        }
        return reply_err(
            daemon,
            &msg,
            ApiError::new(
                ApiErrorCode::InsufficientInstanceCapacity,
                format!("Lost capacity race for {}", type_name),
            ),
        )
        .await;
    }

    let reservation_id = generate_token("r-");
    let mut launched_ids = Vec::new();
    let mut instances = Vec::new();

    for _ in 0..allocated {
        let instance_id = generate_token("i-");
        let mut vm = VmRecord::new(
            instance_id.clone(),
            reservation_id.clone(),
            type_name.clone(),
            input.image_id.clone(),
        );
        vm.key_name = input.key_name.clone();
        vm.user_data = input.user_data.clone();
        vm.last_node = daemon.node_id().to_string();
        vm.ec2 = Some(Ec2Instance::new(
            instance_id.clone(),
            input.image_id.clone(),
            type_name.clone(),
            input.key_name.clone(),
        ));

        // Per-instance service work: declared data volumes get ids and
        // metadata. A failure here releases only this instance's share.
        match build_data_volumes(daemon, &input.block_device_mappings).await {
            Ok(data) => {
                for req in data {
                    vm.upsert_ebs(req);
                }
            }
            Err(e) => {
                warn!("Volume generation for {} failed: {}", instance_id, e);
                let _ = daemon.ledger.deallocate(&type_name).await;
                continue;
            }
        }

        if let Err(e) = daemon.registry.insert(vm).await {
            error!("Registry insert of {} failed: {}", instance_id, e);
            let _ = daemon.ledger.deallocate(&type_name).await;
            continue;
        }
        // Pending once the registry entry is written.
        let _ = daemon.registry.force_status(&instance_id, VmStatus::Pending).await;
        if let Ok(Some(vm)) = daemon
            .registry
            .with_vm(&instance_id, |vm| vm.ec2.clone())
            .await
        {
            instances.push(vm);
        }
        launched_ids.push(instance_id);
    }

    if let Err(e) = daemon.registry.persist(&daemon.kv).await {
        warn!("Persist after reservation {} failed: {}", reservation_id, e);
    }

    if instances.is_empty() {
        return reply_err(
            daemon,
            &msg,
            ApiError::new(
                ApiErrorCode::InsufficientInstanceCapacity,
                "No instance could be provisioned",
            ),
        )
        .await;
    }

    // The reservation goes out before volumes are prepared, so Describe
    // sees the pending instances immediately.
    let reservation = Reservation {
        reservation_id: reservation_id.clone(),
        owner_id: OWNER_ID.to_string(),
        instances,
    };
    reply_ok(daemon, &msg, &reservation).await;
    info!(
        "Reservation {} accepted with {} instance(s)",
        reservation_id,
        launched_ids.len()
    );

    for instance_id in launched_ids {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = launch::launch_instance(&daemon, &instance_id).await {
                error!("Launch of {} failed: {}", instance_id, e);
                fail_launched_instance(&daemon, &instance_id, &e).await;
            }
        });
    }
}

async fn build_data_volumes(
    daemon: &Arc<Daemon>,
    mappings: &[BlockDeviceMappingRequest],
) -> crate::error::Result<Vec<EbsRequest>> {
    let mut out = Vec::new();
    for mapping in mappings {
        let Some(ebs) = &mapping.ebs else { continue };
        let volume_id = match &ebs.volume_id {
            Some(id) => id.clone(),
            None => {
                let id = generate_token("vol-");
                daemon
                    .services
                    .volumes
                    .register(&id, ebs.volume_size.unwrap_or(8))
                    .await?;
                id
            }
        };
        let mut req = EbsRequest::data_volume(volume_id, mapping.device_name.clone());
        req.delete_on_termination = ebs.delete_on_termination;
        req.size_gib = ebs.volume_size;
        out.push(req);
    }
    Ok(out)
}

/// A per-instance launch failure marks the instance with a state reason
/// and walks it toward termination.
async fn fail_launched_instance(daemon: &Arc<Daemon>, instance_id: &str, cause: &HiveError) {
    let _ = daemon
        .registry
        .with_vm(instance_id, |vm| {
            if let Some(ec2) = &mut vm.ec2 {
                ec2.state_reason = Some(StateReason {
                    code: "Server.InternalError".to_string(),
                    message: cause.to_string(),
                });
            }
        })
        .await;
    if let Err(e) = daemon
        .registry
        .transition(&daemon.kv, instance_id, VmStatus::ShuttingDown)
        .await
    {
        warn!("Failed-launch transition for {}: {}", instance_id, e);
    }
    if let Ok(ty) = daemon
        .registry
        .with_vm(instance_id, |vm| vm.instance_type.clone())
        .await
    {
        let _ = daemon.ledger.deallocate(&ty).await;
    }
}

// --- Describe verbs ---

pub async fn handle_describe_instances(daemon: &Arc<Daemon>, msg: BusMessage) {
    let input: DescribeInstancesInput = if msg.payload.is_empty() {
        DescribeInstancesInput::default()
    } else {
        match parse(&msg) {
            Ok(v) => v,
            Err(e) => return reply_err(daemon, &msg, e).await,
        }
    };

    let snapshot = daemon.registry.snapshot().await;
    let vms: Vec<VmRecord> = snapshot
        .vms
        .into_values()
        .filter(|vm| input.instance_ids.is_empty() || input.instance_ids.contains(&vm.id))
        .collect();

    let output = DescribeInstancesOutput {
        reservations: reservations_of(vms),
    };
    reply_ok(daemon, &msg, &output).await;
}

pub async fn handle_describe_instance_types(daemon: &Arc<Daemon>, msg: BusMessage) {
    let input: DescribeInstanceTypesInput = if msg.payload.is_empty() {
        DescribeInstanceTypesInput::default()
    } else {
        match parse(&msg) {
            Ok(v) => v,
            Err(e) => return reply_err(daemon, &msg, e).await,
        }
    };

    let types = daemon
        .ledger
        .available_types(input.show_capacity)
        .into_iter()
        .map(|t| InstanceTypeInfo {
            instance_type: t.name.clone(),
            default_vcpus: t.vcpus,
            memory_mib: t.memory_mib,
            architecture: t.architecture.clone(),
            current_generation: t.current_generation,
            burstable: t.burstable,
        })
        .collect();

    reply_ok(
        daemon,
        &msg,
        &DescribeInstanceTypesOutput {
            instance_types: types,
        },
    )
    .await;
}

pub async fn handle_describe_stopped_instances(daemon: &Arc<Daemon>, msg: BusMessage) {
    let input: DescribeInstancesInput = if msg.payload.is_empty() {
        DescribeInstancesInput::default()
    } else {
        match parse(&msg) {
            Ok(v) => v,
            Err(e) => return reply_err(daemon, &msg, e).await,
        }
    };

    let stopped = match daemon.kv.list_stopped().await {
        Ok(vms) => vms,
        Err(e) => return reply_err(daemon, &msg, ApiError::server_internal(e.to_string())).await,
    };
    let vms: Vec<VmRecord> = stopped
        .into_iter()
        .filter(|vm| input.instance_ids.is_empty() || input.instance_ids.contains(&vm.id))
        .collect();

    let output = DescribeInstancesOutput {
        reservations: reservations_of(vms),
    };
    reply_ok(daemon, &msg, &output).await;
}

// --- Start ---

pub async fn handle_start(daemon: &Arc<Daemon>, msg: BusMessage) {
    let input: InstanceIdRequest = match parse(&msg) {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, &msg, e).await,
    };
    let id = input.instance_id;

    if !valid_instance_id(&id) {
        return reply_err(
            daemon,
            &msg,
            ApiError::new(
                ApiErrorCode::InvalidInstanceIdMalformed,
                format!("'{}' is not a valid instance id", id),
            ),
        )
        .await;
    }
    if daemon.is_shutting_down() {
        return reply_err(
            daemon,
            &msg,
            ApiError::server_internal("node is shutting down"),
        )
        .await;
    }

    if daemon.registry.contains(&id).await {
        start_local(daemon, &msg, &id).await;
    } else {
        start_claimed(daemon, &msg, &id).await;
    }
}

async fn start_local(daemon: &Arc<Daemon>, msg: &BusMessage, id: &str) {
    match daemon.registry.status_of(id).await {
        Some(VmStatus::Stopped) => {}
        Some(status) => {
            return reply_err(
                daemon,
                msg,
                ApiError::new(
                    ApiErrorCode::IncorrectInstanceState,
                    format!("instance {} is {}, not stopped", id, status),
                ),
            )
            .await
        }
        None => {
            return reply_err(
                daemon,
                msg,
                ApiError::new(
                    ApiErrorCode::InvalidInstanceIdNotFound,
                    format!("The instance ID '{}' does not exist", id),
                ),
            )
            .await
        }
    }

    let ty = match daemon.registry.with_vm(id, |vm| vm.instance_type.clone()).await {
        Ok(ty) => ty,
        Err(e) => return reply_err(daemon, msg, (&e).into()).await,
    };
    if let Err(e) = daemon.ledger.allocate(&ty).await {
        return reply_err(daemon, msg, (&e).into()).await;
    }

    let _ = daemon
        .registry
        .with_vm(id, |vm| {
            vm.attributes.start = true;
            vm.attributes.stop = false;
        })
        .await;

    reply_ok(
        daemon,
        msg,
        &InstanceStateChange {
            instance_id: id.to_string(),
            current_state: Ec2State::from(VmStatus::Pending),
            previous_state: Ec2State::from(VmStatus::Stopped),
        },
    )
    .await;

    let daemon = daemon.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        if let Err(e) = launch::launch_instance(&daemon, &id).await {
            error!("Local start of {} failed: {}", id, e);
            let _ = daemon.ledger.deallocate(
                &daemon
                    .registry
                    .with_vm(&id, |vm| vm.instance_type.clone())
                    .await
                    .unwrap_or_default(),
            )
            .await;
        }
    });
}

/// Start of a VM stopped on another node: claim the cluster-owned record,
/// launch locally, and delete the shared entry once the launch succeeds.
async fn start_claimed(daemon: &Arc<Daemon>, msg: &BusMessage, id: &str) {
    let mut vm = match daemon.kv.load_stopped(id).await {
        Ok(Some(vm)) => vm,
        Ok(None) => {
            return reply_err(
                daemon,
                msg,
                ApiError::new(
                    ApiErrorCode::InvalidInstanceIdNotFound,
                    format!("The instance ID '{}' does not exist", id),
                ),
            )
            .await
        }
        Err(e) => return reply_err(daemon, msg, ApiError::server_internal(e.to_string())).await,
    };

    // Reset node-local runtime fields from the previous owner.
    vm.pid = None;
    vm.qmp = None;
    vm.last_node = daemon.node_id().to_string();
    vm.attributes.start = true;
    vm.attributes.stop = false;
    let ty = vm.instance_type.clone();

    if let Err(e) = daemon.ledger.allocate(&ty).await {
        return reply_err(daemon, msg, (&e).into()).await;
    }
    if let Err(e) = daemon.registry.insert(vm).await {
        let _ = daemon.ledger.deallocate(&ty).await;
        return reply_err(daemon, msg, ApiError::server_internal(e.to_string())).await;
    }

    reply_ok(
        daemon,
        msg,
        &InstanceStateChange {
            instance_id: id.to_string(),
            current_state: Ec2State::from(VmStatus::Pending),
            previous_state: Ec2State::from(VmStatus::Stopped),
        },
    )
    .await;

    let daemon = daemon.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        match launch::launch_instance(&daemon, &id).await {
            Ok(()) => {
                // Delete the cluster-owned entry; a stale one risks a
                // duplicate start from another node, so retry once and
                // raise a distinct alert on permanent failure.
                if let Err(first) = daemon.kv.delete_stopped(&id).await {
                    warn!("Deleting shared entry for {} failed: {}", id, first);
                    if let Err(second) = daemon.kv.delete_stopped(&id).await {
                        error!(
                            "ALERT: stale shared entry for started instance {} ({}); duplicate starts possible",
                            id, second
                        );
                    }
                }
            }
            Err(e) => {
                error!("Claimed start of {} failed: {}", id, e);
                let _ = daemon.ledger.deallocate(&ty).await;
                let _ = daemon.registry.remove(&id).await;
                let _ = daemon.registry.persist(&daemon.kv).await;
            }
        }
    });
}

// --- Stop ---

pub async fn handle_stop(daemon: &Arc<Daemon>, msg: BusMessage, id: &str) {
    match daemon
        .registry
        .transition(&daemon.kv, id, VmStatus::Stopping)
        .await
    {
        Ok(()) => {}
        Err(HiveError::InvalidTransition { from, .. }) => {
            return reply_err(
                daemon,
                &msg,
                ApiError::new(
                    ApiErrorCode::IncorrectInstanceState,
                    format!("instance {} is {}, not running", id, from),
                ),
            )
            .await
        }
        Err(e) => return reply_err(daemon, &msg, (&e).into()).await,
    }

    let _ = daemon
        .registry
        .with_vm(id, |vm| vm.attributes.stop = true)
        .await;

    // Reply immediately; the teardown runs behind the reply.
    reply_ok(
        daemon,
        &msg,
        &InstanceStateChange {
            instance_id: id.to_string(),
            current_state: Ec2State::from(VmStatus::Stopping),
            previous_state: Ec2State::from(VmStatus::Running),
        },
    )
    .await;

    let daemon = daemon.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        stop_tail(&daemon, &id).await;
    });
}

/// Asynchronous tail of Stop: power down, reach Stopped, then migrate the
/// record to the cluster-owned namespace.
pub async fn stop_tail(daemon: &Arc<Daemon>, id: &str) {
    controller::stop_instances(daemon, &[id.to_string()], false).await;

    if let Err(e) = daemon
        .registry
        .transition(&daemon.kv, id, VmStatus::Stopped)
        .await
    {
        warn!("Transition of {} to stopped failed: {}", id, e);
    }
    let _ = daemon
        .registry
        .with_vm(id, |vm| {
            vm.pid = None;
            vm.qmp = None;
        })
        .await;

    let vm = match daemon.registry.get_clone(id).await {
        Some(vm) => vm,
        None => return,
    };

    match daemon.kv.write_stopped(id, &vm).await {
        Ok(()) => {
            let removed = daemon.registry.remove(id).await;
            if let Err(e) = daemon.registry.persist(&daemon.kv).await {
                // Keep disk and memory agreeing: put the record back so the
                // next restart retries the migration.
                warn!("Persist after stop-migration of {} failed, re-adding: {}", id, e);
                if let Some(vm) = removed {
                    let _ = daemon.registry.insert(vm).await;
                }
            } else {
                daemon.cancel_cmd_subscription(id).await;
                info!("Instance {} stopped and handed to the cluster", id);
            }
        }
        Err(e) => {
            // Keep it local; a later stop or restart retries.
            warn!("Stop-migration of {} to shared KV failed: {}", id, e);
        }
    }
}

// --- Terminate ---

pub async fn handle_terminate(daemon: &Arc<Daemon>, msg: BusMessage) {
    let input: InstanceIdRequest = match parse(&msg) {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, &msg, e).await,
    };
    let id = input.instance_id.clone();

    if !valid_instance_id(&id) {
        return reply_err(
            daemon,
            &msg,
            ApiError::new(
                ApiErrorCode::InvalidInstanceIdMalformed,
                format!("'{}' is not a valid instance id", id),
            ),
        )
        .await;
    }

    if daemon.registry.contains(&id).await {
        terminate_local(daemon, &msg, &id).await;
    } else {
        terminate_stopped_shared(daemon, &msg, &id).await;
    }
}

pub async fn terminate_local(daemon: &Arc<Daemon>, msg: &BusMessage, id: &str) {
    let previous = daemon.registry.status_of(id).await.unwrap_or(VmStatus::Error);
    match daemon
        .registry
        .transition(&daemon.kv, id, VmStatus::ShuttingDown)
        .await
    {
        Ok(()) => {}
        Err(HiveError::InvalidTransition { from, .. }) => {
            return reply_err(
                daemon,
                msg,
                ApiError::new(
                    ApiErrorCode::IncorrectInstanceState,
                    format!("instance {} is {}", id, from),
                ),
            )
            .await
        }
        Err(e) => return reply_err(daemon, msg, (&e).into()).await,
    }

    let _ = daemon
        .registry
        .with_vm(id, |vm| vm.attributes.terminate = true)
        .await;

    reply_ok(
        daemon,
        msg,
        &InstanceStateChange {
            instance_id: id.to_string(),
            current_state: Ec2State::from(VmStatus::ShuttingDown),
            previous_state: Ec2State::from(previous),
        },
    )
    .await;

    let daemon = daemon.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        controller::stop_instances(&daemon, &[id.clone()], true).await;
        if let Err(e) = daemon
            .registry
            .transition(&daemon.kv, &id, VmStatus::Terminated)
            .await
        {
            warn!("Transition of {} to terminated failed: {}", id, e);
        }
        let _ = daemon
            .registry
            .with_vm(&id, |vm| {
                vm.pid = None;
                vm.qmp = None;
            })
            .await;
        info!("Instance {} terminated", id);
    });
}

/// Terminate a cluster-owned stopped instance: clean its volumes, then
/// drop the shared record.
async fn terminate_stopped_shared(daemon: &Arc<Daemon>, msg: &BusMessage, id: &str) {
    let vm = match daemon.kv.load_stopped(id).await {
        Ok(Some(vm)) => vm,
        Ok(None) => {
            return reply_err(
                daemon,
                msg,
                ApiError::new(
                    ApiErrorCode::InvalidInstanceIdNotFound,
                    format!("The instance ID '{}' does not exist", id),
                ),
            )
            .await
        }
        Err(e) => return reply_err(daemon, msg, ApiError::server_internal(e.to_string())).await,
    };

    for req in vm.ebs_snapshot() {
        if req.efi || req.cloud_init || req.delete_on_termination {
            daemon.binder.delete_backing(&req.volume_id).await;
            if req.user_visible() {
                let _ = daemon.services.volumes.set_deleted(&req.volume_id).await;
            }
        } else if req.user_visible() {
            let _ = daemon.services.volumes.set_available(&req.volume_id).await;
        }
    }

    if let Err(e) = daemon.kv.delete_stopped(id).await {
        return reply_err(daemon, msg, ApiError::server_internal(e.to_string())).await;
    }

    reply_ok(
        daemon,
        msg,
        &InstanceStateChange {
            instance_id: id.to_string(),
            current_state: Ec2State::from(VmStatus::Terminated),
            previous_state: Ec2State::from(VmStatus::Stopped),
        },
    )
    .await;
}

// --- ModifyInstanceAttribute ---

pub async fn handle_modify_instance_attribute(daemon: &Arc<Daemon>, msg: BusMessage) {
    let input: ModifyInstanceAttributeInput = match parse(&msg) {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, &msg, e).await,
    };
    let id = input.instance_id.clone();

    let mut vm = match daemon.kv.load_stopped(&id).await {
        Ok(Some(vm)) => vm,
        Ok(None) => {
            // Only cluster-owned stopped instances are mutable.
            let err = if daemon.registry.contains(&id).await {
                ApiError::new(
                    ApiErrorCode::IncorrectInstanceState,
                    "attributes can only be modified on stopped instances",
                )
            } else {
                ApiError::new(
                    ApiErrorCode::InvalidInstanceIdNotFound,
                    format!("The instance ID '{}' does not exist", id),
                )
            };
            return reply_err(daemon, &msg, err).await;
        }
        Err(e) => return reply_err(daemon, &msg, ApiError::server_internal(e.to_string())).await,
    };

    if let Some(attr) = &input.instance_type {
        if daemon.ledger.catalog().get(&attr.value).is_none() {
            return reply_err(
                daemon,
                &msg,
                ApiError::new(
                    ApiErrorCode::InvalidInstanceAttributeValue,
                    format!("unknown instance type '{}'", attr.value),
                ),
            )
            .await;
        }
        vm.instance_type = attr.value.clone();
        if let Some(ec2) = &mut vm.ec2 {
            ec2.instance_type = attr.value.clone();
        }
    }
    if let Some(attr) = &input.user_data {
        vm.user_data = Some(attr.value.clone());
    }

    match daemon.kv.write_stopped(&id, &vm).await {
        Ok(()) => reply_ok(daemon, &msg, &json!({ "Return": true })).await,
        Err(e) => reply_err(daemon, &msg, ApiError::server_internal(e.to_string())).await,
    }
}

// --- CreateImage ---

pub async fn handle_create_image(daemon: &Arc<Daemon>, msg: BusMessage) {
    let input: CreateImageInput = match parse(&msg) {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, &msg, e).await,
    };

    let boot = match daemon.registry.get_clone(&input.instance_id).await {
        Some(vm) => vm.boot_volume(),
        None => {
            return reply_err(
                daemon,
                &msg,
                ApiError::new(
                    ApiErrorCode::InvalidInstanceIdNotFound,
                    format!("The instance ID '{}' does not exist", input.instance_id),
                ),
            )
            .await
        }
    };

    let Some(boot) = boot else {
        return reply_err(
            daemon,
            &msg,
            ApiError::server_internal(format!(
                "instance {} has no boot volume",
                input.instance_id
            )),
        )
        .await;
    };

    // Flush the root volume so the image snapshot is consistent.
    daemon.binder.sync(&boot.volume_id).await;

    let output = CreateImageOutput {
        image_id: generate_token("ami-"),
        source_volume_id: boot.volume_id,
    };
    reply_ok(daemon, &msg, &output).await;
}

// --- targeted per-instance commands ---

pub async fn handle_instance_command(daemon: &Arc<Daemon>, id: &str, msg: BusMessage) {
    let cmd: InstanceCommand = match parse(&msg) {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, &msg, e).await,
    };

    match cmd {
        InstanceCommand::AttachVolume { volume_id, device } => {
            handle_attach(daemon, &msg, id, &volume_id, device.as_deref()).await
        }
        InstanceCommand::DetachVolume { volume_id, force } => {
            handle_detach(daemon, &msg, id, &volume_id, force).await
        }
        InstanceCommand::Start => start_local(daemon, &msg, id).await,
        InstanceCommand::Stop => handle_stop(daemon, msg, id).await,
        InstanceCommand::Terminate => terminate_local(daemon, &msg, id).await,
        InstanceCommand::Qmp { execute, arguments } => {
            handle_qmp_passthrough(daemon, &msg, id, &execute, arguments).await
        }
    }
}

async fn running_vm_with_qmp(
    daemon: &Arc<Daemon>,
    id: &str,
) -> Result<(VmRecord, Arc<dyn crate::qemu::QmpSession>), ApiError> {
    let vm = daemon
        .registry
        .get_clone(id)
        .await
        .ok_or_else(|| {
            ApiError::new(
                ApiErrorCode::InvalidInstanceIdNotFound,
                format!("The instance ID '{}' does not exist", id),
            )
        })?;
    if vm.status != VmStatus::Running {
        return Err(ApiError::new(
            ApiErrorCode::IncorrectInstanceState,
            format!("instance {} is {}, not running", id, vm.status),
        ));
    }
    let qmp = vm.qmp.clone().ok_or_else(|| {
        ApiError::server_internal(format!("instance {} has no control channel", id))
    })?;
    Ok((vm, qmp))
}

async fn handle_attach(
    daemon: &Arc<Daemon>,
    msg: &BusMessage,
    id: &str,
    volume_id: &str,
    device: Option<&str>,
) {
    let (vm, qmp) = match running_vm_with_qmp(daemon, id).await {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, msg, e).await,
    };

    let _ = daemon
        .registry
        .with_vm(id, |vm| vm.attributes.attach = true)
        .await;

    let outcome = match daemon.binder.attach(&vm, qmp.as_ref(), volume_id, device).await {
        Ok(outcome) => outcome,
        Err(e) => return reply_err(daemon, msg, (&e).into()).await,
    };

    let device_name = outcome.device_name.clone();
    let block_uri = outcome.block_uri.clone();
    let volume = volume_id.to_string();
    let _ = daemon
        .registry
        .with_vm(id, move |vm| {
            let mut req = EbsRequest::data_volume(volume.clone(), device_name.clone());
            req.block_uri = Some(block_uri);
            vm.upsert_ebs(req);
            if let Some(ec2) = &mut vm.ec2 {
                ec2.upsert_block_device(BlockDeviceMapping {
                    device_name: device_name.clone(),
                    ebs: EbsAttachment {
                        volume_id: volume,
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
        .set_in_use(volume_id, id, &outcome.device_name)
        .await
    {
        warn!("Marking {} in-use failed: {}", volume_id, e);
    }
    if let Err(e) = daemon.registry.persist(&daemon.kv).await {
        warn!("Persist after attach of {} failed: {}", volume_id, e);
    }

    reply_ok(
        daemon,
        msg,
        &AttachVolumeOutput {
            volume_id: volume_id.to_string(),
            instance_id: id.to_string(),
            device: outcome.device_name,
            state: "attached".to_string(),
        },
    )
    .await;
}

async fn handle_detach(
    daemon: &Arc<Daemon>,
    msg: &BusMessage,
    id: &str,
    volume_id: &str,
    force: bool,
) {
    let (vm, qmp) = match running_vm_with_qmp(daemon, id).await {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, msg, e).await,
    };

    let _ = daemon
        .registry
        .with_vm(id, |vm| vm.attributes.detach = true)
        .await;

    if let Err(e) = daemon.binder.detach(&vm, qmp.as_ref(), volume_id, force).await {
        return reply_err(daemon, msg, (&e).into()).await;
    }

    let volume = volume_id.to_string();
    let device = vm
        .find_ebs(volume_id)
        .map(|e| e.device_name)
        .unwrap_or_default();
    let _ = daemon
        .registry
        .with_vm(id, move |vm| {
            vm.remove_ebs(&volume);
            if let Some(ec2) = &mut vm.ec2 {
                ec2.remove_block_device(&volume);
            }
        })
        .await;

    if let Err(e) = daemon.services.volumes.set_available(volume_id).await {
        warn!("Marking {} available failed: {}", volume_id, e);
    }
    if let Err(e) = daemon.registry.persist(&daemon.kv).await {
        warn!("Persist after detach of {} failed: {}", volume_id, e);
    }

    reply_ok(
        daemon,
        msg,
        &AttachVolumeOutput {
            volume_id: volume_id.to_string(),
            instance_id: id.to_string(),
            device,
            state: "detached".to_string(),
        },
    )
    .await;
}

async fn handle_qmp_passthrough(
    daemon: &Arc<Daemon>,
    msg: &BusMessage,
    id: &str,
    execute: &str,
    arguments: Option<serde_json::Value>,
) {
    let (_vm, qmp) = match running_vm_with_qmp(daemon, id).await {
        Ok(v) => v,
        Err(e) => return reply_err(daemon, msg, e).await,
    };

    match qmp.execute(execute, arguments).await {
        Ok(value) => reply_ok(daemon, msg, &value).await,
        Err(e) => reply_err(daemon, msg, (&e).into()).await,
    }
}

// --- pass-through verbs ---

pub async fn handle_passthrough(daemon: &Arc<Daemon>, verb: &str, msg: BusMessage) {
    let payload: serde_json::Value = if msg.payload.is_empty() {
        serde_json::Value::Null
    } else {
        match parse(&msg) {
            Ok(v) => v,
            Err(e) => return reply_err(daemon, &msg, e).await,
        }
    };

    match daemon.services.passthrough.handle(verb, payload).await {
        Ok(value) => reply_ok(daemon, &msg, &value).await,
        Err(e) => reply_err(daemon, &msg, (&e).into()).await,
    }
}

// --- admin ---

pub async fn handle_admin_health(daemon: &Arc<Daemon>, msg: BusMessage) {
    let snapshot = daemon.registry.snapshot().await;
    let vms: Vec<serde_json::Value> = snapshot
        .vms
        .values()
        .map(|vm| {
            json!({
                "instance_id": vm.id,
                "status": vm.status,
                "instance_type": vm.instance_type,
                "health": vm.health,
            })
        })
        .collect();

    reply_ok(
        daemon,
        &msg,
        &json!({
            "node": daemon.node_id(),
            "shutting_down": daemon.is_shutting_down(),
            "ledger": daemon.ledger.stats(),
            "vms": vms,
        }),
    )
    .await;
}

pub async fn handle_node_status(daemon: &Arc<Daemon>, msg: BusMessage) {
    reply_ok(
        daemon,
        &msg,
        &json!({
            "node": daemon.node_id(),
            "shutting_down": daemon.is_shutting_down(),
            "vm_count": daemon.registry.len().await,
            "ledger": daemon.ledger.stats(),
        }),
    )
    .await;
}

pub async fn handle_node_vms(daemon: &Arc<Daemon>, msg: BusMessage) {
    let snapshot = daemon.registry.snapshot().await;
    reply_ok(daemon, &msg, &json!({ "node": daemon.node_id(), "vms": snapshot.vms })).await;
}

pub async fn handle_nodes_discover(daemon: &Arc<Daemon>, msg: BusMessage) {
    reply_ok(
        daemon,
        &msg,
        &json!({
            "node": daemon.node_id(),
            "ledger": daemon.ledger.stats(),
            "available_types": daemon
                .ledger
                .available_types(false)
                .iter()
                .map(|t| t.name.clone())
                .collect::<Vec<_>>(),
        }),
    )
    .await;
}
