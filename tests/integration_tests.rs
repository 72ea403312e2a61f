use async_trait::async_trait;
use hive::bus::{subjects, MemoryBus, MessageBus};
use hive::cluster;
use hive::config::{DaemonConfig, WORKER_QUEUE_GROUP};
use hive::daemon::{new_daemon, Daemon};
use hive::error::Result as HiveResult;
use hive::instance::{EbsRequest, Registry, VmRecord, VmStatus};
use hive::kv::{KvGateway, MemoryKv};
use hive::qemu::QmpSession;
use hive::rpc::api::*;
use hive::services::{
    MemoryBlockFactory, MemoryImageService, MemoryKeyPairService, MemoryVolumeService,
    NullCloudInitBuilder, NullPassthroughService, NullProcessControl, Services,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// QMP stand-in for instances that never had a real hypervisor.
#[derive(Default)]
struct ScriptedQmp {
    executed: Mutex<Vec<String>>,
}

#[async_trait]
impl QmpSession for ScriptedQmp {
    async fn execute(&self, command: &str, _arguments: Option<Value>) -> HiveResult<Value> {
        self.executed.lock().unwrap().push(command.to_string());
        Ok(json!({ "status": "running", "running": true }))
    }

    async fn close(&self) {}
}

struct TestEnv {
    daemon: Arc<Daemon>,
    bus: Arc<MemoryBus>,
    volumes: Arc<MemoryVolumeService>,
    _run_dir: TempDir,
}

impl TestEnv {
    async fn request<T: serde::Serialize>(&self, subject: &str, body: &T) -> Value {
        let payload = serde_json::to_vec(body).unwrap();
        let reply = self
            .bus
            .request(subject, payload.into(), REQUEST_TIMEOUT)
            .await
            .unwrap();
        serde_json::from_slice(&reply).unwrap()
    }
}

fn base_services() -> (
    Services,
    Arc<MemoryImageService>,
    Arc<MemoryVolumeService>,
    Arc<MemoryBlockFactory>,
) {
    let images = Arc::new(MemoryImageService::default());
    images.insert("ami-abc", "img-src");
    let keys = Arc::new(MemoryKeyPairService::default());
    keys.insert("ops", "ssh-ed25519 AAAA ops");
    let volumes = Arc::new(MemoryVolumeService::default());
    let blocks = Arc::new(MemoryBlockFactory::default());
    blocks.preload("img-src", vec![7u8; 64 * 1024]);

    let services = Services {
        images: images.clone(),
        keys,
        volumes: volumes.clone(),
        blocks: blocks.clone(),
        cloud_init: Arc::new(NullCloudInitBuilder),
        passthrough: Arc::new(NullPassthroughService),
        processes: Arc::new(NullProcessControl::default()),
    };
    (services, images, volumes, blocks)
}

/// Answer the block daemon's mount/unmount/delete topics in-process.
fn spawn_block_daemon(bus: &Arc<MemoryBus>, node: &str) {
    for subject in [subjects::ebs_mount(node), subjects::ebs_unmount(node)] {
        let bus2 = bus.clone();
        let mounting = subject.ends_with(".mount");
        tokio::spawn(async move {
            let mut sub = bus2.queue_subscribe(&subject, "ebs").await.unwrap();
            while let Some(msg) = sub.next().await {
                let req: Value = serde_json::from_slice(&msg.payload).unwrap_or(Value::Null);
                let volume = req["volume"].as_str().unwrap_or("").to_string();
                let reply = if mounting {
                    json!({ "uri": format!("nbd://127.0.0.1:10809/{}", volume), "mounted": true })
                } else {
                    json!({ "mounted": false })
                };
                let payload = serde_json::to_vec(&reply).unwrap();
                let _ = bus2
                    .publish(msg.reply.as_deref().unwrap(), payload.into())
                    .await;
            }
        });
    }

    let bus2 = bus.clone();
    tokio::spawn(async move {
        let mut sub = bus2
            .queue_subscribe(subjects::EBS_DELETE, "ebs")
            .await
            .unwrap();
        while let Some(msg) = sub.next().await {
            let payload = serde_json::to_vec(&json!({ "deleted": true })).unwrap();
            let _ = bus2
                .publish(msg.reply.as_deref().unwrap(), payload.into())
                .await;
        }
    });
}

async fn create_env(node: &str) -> TestEnv {
    let bus = Arc::new(MemoryBus::new());
    let kv_provider = Arc::new(MemoryKv::new());
    let kv = Arc::new(KvGateway::open(kv_provider, 1).await.unwrap());

    let (services, _images, volumes, _blocks) = base_services();
    spawn_block_daemon(&bus, node);

    let run_dir = TempDir::new().unwrap();
    let mut config = DaemonConfig::new(node, "memory://");
    config.vcpu_limit = Some(16);
    config.memory_limit_gib = Some(64.0);
    config.detach_delay = Duration::ZERO;
    config.run_dir = run_dir.path().to_path_buf();

    let daemon = new_daemon(config, bus.clone(), kv, services);
    hive::rpc::bind(&daemon).await.unwrap();
    cluster::bind(&daemon).await.unwrap();

    TestEnv {
        daemon,
        bus,
        volumes,
        _run_dir: run_dir,
    }
}

/// Place a VM directly into the registry as if it were running, with a
/// scripted QMP session standing in for the hypervisor.
async fn seed_running_vm(env: &TestEnv, id: &str) -> Arc<ScriptedQmp> {
    let mut vm = VmRecord::new(id, "r-seed", "t3.micro", "ami-abc");
    vm.last_node = env.daemon.node_id().to_string();
    vm.ec2 = Some(Ec2Instance::new(id, "ami-abc", "t3.micro", None));
    let mut boot = EbsRequest::data_volume(format!("vol-boot-{}", id), "/dev/sda");
    boot.boot = true;
    boot.delete_on_termination = true;
    vm.upsert_ebs(boot);

    env.daemon.ledger.allocate("t3.micro").await.unwrap();
    env.daemon.registry.insert(vm).await.unwrap();
    env.daemon.registry.force_status(id, VmStatus::Pending).await.unwrap();
    env.daemon
        .registry
        .transition(&env.daemon.kv, id, VmStatus::Running)
        .await
        .unwrap();

    let qmp = Arc::new(ScriptedQmp::default());
    let handle: Arc<dyn QmpSession> = qmp.clone();
    env.daemon
        .registry
        .with_vm(id, move |vm| vm.qmp = Some(handle))
        .await
        .unwrap();
    env.daemon.install_cmd_subscription(id).await.unwrap();
    qmp
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_run_instances_reserves_and_allocates() {
    let env = create_env("node0").await;

    let input = json!({
        "ImageId": "ami-abc",
        "InstanceType": "t3.micro",
        "MinCount": 1,
        "MaxCount": 1,
        "KeyName": "ops",
    });
    let reply = env
        .request(&subjects::run_instances("t3.micro"), &input)
        .await;

    let reservation: Reservation = serde_json::from_value(reply).unwrap();
    assert!(reservation.reservation_id.starts_with("r-"));
    assert_eq!(reservation.instances.len(), 1);
    assert_eq!(reservation.instances[0].state.code, 0);
    assert_eq!(reservation.instances[0].state.name, "pending");
    assert!(reservation.instances[0].instance_id.starts_with("i-"));

    // The reservation reply lands before volumes are prepared, with the
    // ledger share already held.
    let stats = env.daemon.ledger.stats();
    assert_eq!(stats.allocated_vcpu, 2);
    assert_eq!(stats.allocated_mem_gib, 1.0);

    // The pending instance is immediately visible to Describe.
    let described = env
        .request(subjects::DESCRIBE_INSTANCES, &json!({}))
        .await;
    let output: DescribeInstancesOutput = serde_json::from_value(described).unwrap();
    assert_eq!(output.reservations.len(), 1);
    assert_eq!(
        output.reservations[0].instances[0].instance_id,
        reservation.instances[0].instance_id
    );
}

#[tokio::test]
async fn test_run_instances_below_min_count_rolls_back() {
    let env = create_env("node0").await;

    // 16 vCPUs fit two t3.2xlarge; five are required.
    let input = json!({
        "ImageId": "ami-abc",
        "InstanceType": "t3.2xlarge",
        "MinCount": 5,
        "MaxCount": 10,
    });
    let reply = env
        .request(&subjects::run_instances("t3.2xlarge"), &input)
        .await;

    assert_eq!(reply["Code"], "InsufficientInstanceCapacity");
    let stats = env.daemon.ledger.stats();
    assert_eq!(stats.allocated_vcpu, 0);
    assert_eq!(stats.allocated_mem_gib, 0.0);
    assert_eq!(env.daemon.registry.len().await, 0);
}

#[tokio::test]
async fn test_run_instances_validation_errors() {
    let env = create_env("node0").await;

    let reply = env
        .request(
            &subjects::run_instances("t3.micro"),
            &json!({
                "ImageId": "ami-nope",
                "InstanceType": "t3.micro",
                "MinCount": 1,
                "MaxCount": 1,
            }),
        )
        .await;
    assert_eq!(reply["Code"], "InvalidAMIID.NotFound");

    let reply = env
        .request(
            &subjects::run_instances("t3.micro"),
            &json!({
                "ImageId": "ami-abc",
                "InstanceType": "t3.micro",
                "MinCount": 1,
                "MaxCount": 1,
                "KeyName": "missing",
            }),
        )
        .await;
    assert_eq!(reply["Code"], "InvalidKeyPair.NotFound");

    let reply = env
        .request(
            &subjects::run_instances("t3.micro"),
            &json!({
                "ImageId": "ami-abc",
                "InstanceType": "t3.micro",
                "MinCount": 0,
                "MaxCount": 1,
            }),
        )
        .await;
    assert_eq!(reply["Code"], "InvalidParameterValue");

    // Validation precedes allocation: nothing stuck in the ledger.
    assert_eq!(env.daemon.ledger.stats().allocated_vcpu, 0);
}

#[tokio::test]
async fn test_capacity_gated_launch_topics() {
    let env = create_env("node0").await;

    assert!(env
        .bus
        .has_queue_subscriber(&subjects::run_instances("t3.micro"), WORKER_QUEUE_GROUP));
    assert!(env
        .bus
        .has_queue_subscriber(&subjects::run_instances("t3.2xlarge"), WORKER_QUEUE_GROUP));

    // Fill the node: both t3.2xlarge slots.
    env.daemon.ledger.allocate("t3.2xlarge").await.unwrap();
    env.daemon.ledger.allocate("t3.2xlarge").await.unwrap();
    assert_eq!(env.daemon.ledger.stats().allocated_vcpu, 16);

    wait_until(|| async {
        !env.bus
            .has_queue_subscriber(&subjects::run_instances("t3.micro"), WORKER_QUEUE_GROUP)
    })
    .await;

    // A launch request now times out: no node has room.
    let err = env
        .bus
        .request(
            &subjects::run_instances("t3.micro"),
            serde_json::to_vec(&json!({
                "ImageId": "ami-abc",
                "InstanceType": "t3.micro",
                "MinCount": 1,
                "MaxCount": 1,
            }))
            .unwrap()
            .into(),
            Duration::from_millis(200),
        )
        .await;
    assert!(err.is_err());

    // Freeing capacity brings the topics back.
    env.daemon.ledger.deallocate("t3.2xlarge").await.unwrap();
    wait_until(|| async {
        env.bus
            .has_queue_subscriber(&subjects::run_instances("t3.micro"), WORKER_QUEUE_GROUP)
    })
    .await;
}

#[tokio::test]
async fn test_describe_instance_types() {
    let env = create_env("node0").await;

    let reply = env
        .request(subjects::DESCRIBE_INSTANCE_TYPES, &json!({}))
        .await;
    let output: DescribeInstanceTypesOutput = serde_json::from_value(reply).unwrap();

    let names: Vec<&str> = output
        .instance_types
        .iter()
        .map(|t| t.instance_type.as_str())
        .collect();
    assert!(names.contains(&"t3.micro"));
    assert!(names.contains(&"m5.2xlarge"));
    // Collapsed form: each type at most once.
    let unique: std::collections::HashSet<&&str> = names.iter().collect();
    assert_eq!(unique.len(), names.len());

    let micro = output
        .instance_types
        .iter()
        .find(|t| t.instance_type == "t3.micro")
        .unwrap();
    assert_eq!(micro.default_vcpus, 2);
    assert_eq!(micro.memory_mib, 1024);
    assert!(micro.burstable);
}

#[tokio::test]
async fn test_attach_and_detach_preserve_mappings() {
    let env = create_env("node0").await;
    let qmp = seed_running_vm(&env, "i-att").await;
    env.volumes.insert_available("vol-data", 16);

    let reply = env
        .request(
            &subjects::instance_cmd("i-att"),
            &json!({ "op": "attach_volume", "volume_id": "vol-data" }),
        )
        .await;
    let output: AttachVolumeOutput = serde_json::from_value(reply).unwrap();
    assert_eq!(output.state, "attached");
    assert_eq!(output.device, "/dev/sdf");
    assert_eq!(
        qmp.executed.lock().unwrap().clone(),
        vec!["blockdev-add", "device_add"]
    );

    let vm = env.daemon.registry.get_clone("i-att").await.unwrap();
    let data = vm.find_ebs("vol-data").unwrap();
    assert_eq!(data.device_name, "/dev/sdf");
    assert!(data.block_uri.as_deref().unwrap().contains("vol-data"));
    let ec2 = vm.ec2.as_ref().unwrap();
    assert_eq!(ec2.block_device_mappings.len(), 1);
    assert_eq!(env.volumes.meta("vol-data").unwrap().state, "in-use");

    // Detaching the boot volume is refused with no state change.
    let reply = env
        .request(
            &subjects::instance_cmd("i-att"),
            &json!({ "op": "detach_volume", "volume_id": "vol-boot-i-att" }),
        )
        .await;
    assert_eq!(reply["Code"], "OperationNotPermitted");
    assert!(env
        .daemon
        .registry
        .get_clone("i-att")
        .await
        .unwrap()
        .boot_volume()
        .is_some());

    // Detaching the data volume walks the reverse phases.
    let reply = env
        .request(
            &subjects::instance_cmd("i-att"),
            &json!({ "op": "detach_volume", "volume_id": "vol-data" }),
        )
        .await;
    let output: AttachVolumeOutput = serde_json::from_value(reply).unwrap();
    assert_eq!(output.state, "detached");

    let vm = env.daemon.registry.get_clone("i-att").await.unwrap();
    assert!(vm.find_ebs("vol-data").is_none());
    assert!(vm.ec2.as_ref().unwrap().block_device_mappings.is_empty());
    assert_eq!(env.volumes.meta("vol-data").unwrap().state, "available");
}

#[tokio::test]
async fn test_attach_fills_device_letters_in_order() {
    let env = create_env("node0").await;
    let _qmp = seed_running_vm(&env, "i-slots").await;

    for (i, expected) in [(0, "/dev/sdf"), (1, "/dev/sdg"), (2, "/dev/sdh")] {
        let vol = format!("vol-d{}", i);
        env.volumes.insert_available(&vol, 8);
        let reply = env
            .request(
                &subjects::instance_cmd("i-slots"),
                &json!({ "op": "attach_volume", "volume_id": vol }),
            )
            .await;
        assert_eq!(reply["Device"], expected);
    }
}

#[tokio::test]
async fn test_stop_migrates_to_shared_kv_and_start_reclaims() {
    let env = create_env("node0").await;
    seed_running_vm(&env, "i-stop").await;
    env.daemon
        .registry
        .with_vm("i-stop", |vm| {
            vm.upsert_ebs(EbsRequest::data_volume("vol-keep", "/dev/sdf"));
        })
        .await
        .unwrap();

    let reply = env
        .request(&subjects::instance_cmd("i-stop"), &json!({ "op": "stop" }))
        .await;
    let change: InstanceStateChange = serde_json::from_value(reply).unwrap();
    assert_eq!(change.current_state.name, "stopping");

    // The async tail powers the VM down, reaches Stopped, and hands the
    // record to the cluster.
    wait_until(|| async {
        env.daemon
            .kv
            .load_stopped("i-stop")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let stopped = env.daemon.kv.load_stopped("i-stop").await.unwrap().unwrap();
    assert_eq!(stopped.status, VmStatus::Stopped);
    assert_eq!(stopped.last_node, "node0");
    // Attached data volumes and their device names survive the stop.
    let kept = stopped.find_ebs("vol-keep").unwrap();
    assert_eq!(kept.device_name, "/dev/sdf");
    assert_eq!(stopped.health.restart_count, 0);
    assert!(!env.daemon.registry.contains("i-stop").await);
    assert_eq!(env.daemon.ledger.stats().allocated_vcpu, 0);

    // Start claims the cluster-owned record back onto this node.
    let reply = env
        .request(subjects::EC2_START, &json!({ "instance_id": "i-stop" }))
        .await;
    let change: InstanceStateChange = serde_json::from_value(reply).unwrap();
    assert_eq!(change.previous_state.name, "stopped");
    assert_eq!(change.current_state.name, "pending");

    let vm = env.daemon.registry.get_clone("i-stop").await.unwrap();
    assert_eq!(vm.find_ebs("vol-keep").unwrap().device_name, "/dev/sdf");
    assert_eq!(vm.health.restart_count, 0);
    assert_eq!(env.daemon.ledger.stats().allocated_vcpu, 2);
}

#[tokio::test]
async fn test_start_unknown_instance() {
    let env = create_env("node0").await;

    let reply = env
        .request(subjects::EC2_START, &json!({ "instance_id": "i-ghost" }))
        .await;
    assert_eq!(reply["Code"], "InvalidInstanceID.NotFound");

    let reply = env
        .request(subjects::EC2_START, &json!({ "instance_id": "garbage" }))
        .await;
    assert_eq!(reply["Code"], "InvalidInstanceID.Malformed");
}

#[tokio::test]
async fn test_stop_of_non_running_instance_rejected() {
    let env = create_env("node0").await;
    seed_running_vm(&env, "i-once").await;
    env.daemon
        .registry
        .force_status("i-once", VmStatus::Stopped)
        .await
        .unwrap();

    let reply = env
        .request(&subjects::instance_cmd("i-once"), &json!({ "op": "stop" }))
        .await;
    assert_eq!(reply["Code"], "IncorrectInstanceState");
}

#[tokio::test]
async fn test_terminate_cleans_up() {
    let env = create_env("node0").await;
    seed_running_vm(&env, "i-term").await;

    let reply = env
        .request(&subjects::instance_cmd("i-term"), &json!({ "op": "terminate" }))
        .await;
    let change: InstanceStateChange = serde_json::from_value(reply).unwrap();
    assert_eq!(change.current_state.name, "shutting-down");

    wait_until(|| async {
        env.daemon.registry.status_of("i-term").await == Some(VmStatus::Terminated)
    })
    .await;

    assert_eq!(env.daemon.ledger.stats().allocated_vcpu, 0);
    // The targeted command topic is gone with the instance.
    wait_until(|| async { !env.daemon.has_cmd_subscription("i-term").await }).await;
}

#[tokio::test]
async fn test_modify_instance_attribute_stopped_only() {
    let env = create_env("node0").await;

    let mut vm = VmRecord::new("i-mod", "r-mod", "t3.micro", "ami-abc");
    vm.apply_status(VmStatus::Stopped);
    vm.ec2 = Some(Ec2Instance::new("i-mod", "ami-abc", "t3.micro", None));
    env.daemon.kv.write_stopped("i-mod", &vm).await.unwrap();

    let reply = env
        .request(
            subjects::MODIFY_INSTANCE_ATTRIBUTE,
            &json!({
                "InstanceId": "i-mod",
                "InstanceType": { "Value": "t3.small" },
                "UserData": { "Value": "#cloud-config\n" },
            }),
        )
        .await;
    assert_eq!(reply["Return"], true);

    let updated = env.daemon.kv.load_stopped("i-mod").await.unwrap().unwrap();
    assert_eq!(updated.instance_type, "t3.small");
    assert_eq!(updated.user_data.as_deref(), Some("#cloud-config\n"));
    assert_eq!(updated.ec2.as_ref().unwrap().instance_type, "t3.small");

    let reply = env
        .request(
            subjects::MODIFY_INSTANCE_ATTRIBUTE,
            &json!({
                "InstanceId": "i-mod",
                "InstanceType": { "Value": "notatype" },
            }),
        )
        .await;
    assert_eq!(reply["Code"], "InvalidInstanceAttributeValue");

    // A running local instance is not modifiable.
    seed_running_vm(&env, "i-live").await;
    let reply = env
        .request(
            subjects::MODIFY_INSTANCE_ATTRIBUTE,
            &json!({
                "InstanceId": "i-live",
                "InstanceType": { "Value": "t3.small" },
            }),
        )
        .await;
    assert_eq!(reply["Code"], "IncorrectInstanceState");
}

#[tokio::test]
async fn test_describe_stopped_instances() {
    let env = create_env("node0").await;

    let mut vm = VmRecord::new("i-s1", "r-s1", "t3.micro", "ami-abc");
    vm.apply_status(VmStatus::Stopped);
    vm.ec2 = Some(Ec2Instance::new("i-s1", "ami-abc", "t3.micro", None));
    env.daemon.kv.write_stopped("i-s1", &vm).await.unwrap();

    let reply = env
        .request(subjects::DESCRIBE_STOPPED_INSTANCES, &json!({}))
        .await;
    let output: DescribeInstancesOutput = serde_json::from_value(reply).unwrap();
    assert_eq!(output.reservations.len(), 1);
    assert_eq!(output.reservations[0].instances[0].instance_id, "i-s1");
}

#[tokio::test]
async fn test_qmp_passthrough() {
    let env = create_env("node0").await;
    let qmp = seed_running_vm(&env, "i-qmp").await;

    let reply = env
        .request(
            &subjects::instance_cmd("i-qmp"),
            &json!({ "op": "qmp", "execute": "query-status" }),
        )
        .await;
    assert_eq!(reply["status"], "running");
    assert!(qmp
        .executed
        .lock()
        .unwrap()
        .contains(&"query-status".to_string()));
}

#[tokio::test]
async fn test_create_image_reads_root_volume() {
    let env = create_env("node0").await;
    seed_running_vm(&env, "i-img").await;

    let reply = env
        .request(
            subjects::CREATE_IMAGE,
            &json!({ "InstanceId": "i-img", "Name": "golden" }),
        )
        .await;
    let output: CreateImageOutput = serde_json::from_value(reply).unwrap();
    assert!(output.image_id.starts_with("ami-"));
    assert_eq!(output.source_volume_id, "vol-boot-i-img");
}

// Interrupted stop: the daemon persisted Stopping, then died with the
// hypervisor. Restart must finish the stop and hand the record over.
#[tokio::test]
async fn test_recovery_finishes_interrupted_stop() {
    let bus = Arc::new(MemoryBus::new());
    let kv_provider = Arc::new(MemoryKv::new());
    let kv = Arc::new(KvGateway::open(kv_provider.clone(), 1).await.unwrap());
    let (services, _images, _volumes, _blocks) = base_services();
    spawn_block_daemon(&bus, "node0");

    // Persisted state from the previous run.
    let previous = Registry::new("node0");
    let mut vm = VmRecord::new("i-rec", "r-rec", "t3.micro", "ami-abc");
    vm.apply_status(VmStatus::Stopping);
    vm.ec2 = Some(Ec2Instance::new("i-rec", "ami-abc", "t3.micro", None));
    previous.insert(vm).await.unwrap();
    previous.persist(&kv).await.unwrap();

    let run_dir = TempDir::new().unwrap();
    let mut config = DaemonConfig::new("node0", "memory://");
    config.vcpu_limit = Some(16);
    config.memory_limit_gib = Some(64.0);
    config.run_dir = run_dir.path().to_path_buf();

    let daemon = new_daemon(config, bus, kv, services);
    hive::recover::run(&daemon).await.unwrap();

    let shared = daemon.kv.load_stopped("i-rec").await.unwrap().unwrap();
    assert_eq!(shared.status, VmStatus::Stopped);
    assert_eq!(shared.last_node, "node0");
    assert!(!daemon.registry.contains("i-rec").await);
    assert_eq!(daemon.ledger.stats().allocated_vcpu, 0);
}

#[tokio::test]
async fn test_recovery_dispositions() {
    let bus = Arc::new(MemoryBus::new());
    let kv_provider = Arc::new(MemoryKv::new());
    let kv = Arc::new(KvGateway::open(kv_provider.clone(), 1).await.unwrap());
    let (services, _images, _volumes, _blocks) = base_services();
    spawn_block_daemon(&bus, "node0");

    let previous = Registry::new("node0");
    for (id, status) in [
        ("i-gone", VmStatus::Terminated),
        ("i-stopped", VmStatus::Stopped),
        ("i-half-term", VmStatus::ShuttingDown),
    ] {
        let mut vm = VmRecord::new(id, "r-x", "t3.micro", "ami-abc");
        vm.apply_status(status);
        vm.ec2 = Some(Ec2Instance::new(id, "ami-abc", "t3.micro", None));
        previous.insert(vm).await.unwrap();
    }
    previous.persist(&kv).await.unwrap();

    let run_dir = TempDir::new().unwrap();
    let mut config = DaemonConfig::new("node0", "memory://");
    config.vcpu_limit = Some(16);
    config.memory_limit_gib = Some(64.0);
    config.run_dir = run_dir.path().to_path_buf();
    let daemon = new_daemon(config, bus, kv, services);
    // Clean restart: the marker skips the crash-settling delay.
    daemon.kv.write_shutdown_marker("node0").await.unwrap();

    hive::recover::run(&daemon).await.unwrap();

    // Terminated stays local and untouched.
    assert_eq!(
        daemon.registry.status_of("i-gone").await,
        Some(VmStatus::Terminated)
    );
    // Stopped migrated to the cluster.
    assert!(!daemon.registry.contains("i-stopped").await);
    assert!(daemon
        .kv
        .load_stopped("i-stopped")
        .await
        .unwrap()
        .is_some());
    // An interrupted terminate completes.
    assert_eq!(
        daemon.registry.status_of("i-half-term").await,
        Some(VmStatus::Terminated)
    );
    // The marker was consumed.
    assert!(!daemon.kv.shutdown_marker_exists("node0").await.unwrap());
}

#[tokio::test]
async fn test_cluster_shutdown_phases() {
    let env = create_env("node0").await;
    seed_running_vm(&env, "i-drain").await;

    let mut acks = env.bus.subscribe(subjects::SHUTDOWN_ACK).await.unwrap();

    // GATE: work is refused from here on.
    env.bus
        .publish(
            &subjects::cluster_shutdown("gate"),
            serde_json::to_vec(&json!({ "phase": "gate", "force": false, "timeout_seconds": 5 }))
                .unwrap()
                .into(),
        )
        .await
        .unwrap();
    let ack = acks.next().await.unwrap();
    let ack: Value = serde_json::from_slice(&ack.payload).unwrap();
    assert_eq!(ack["phase"], "gate");
    assert_eq!(ack["node"], "node0");
    assert!(env.daemon.is_shutting_down());

    // DRAIN: instances stopped, marker written, state persisted.
    env.bus
        .publish(
            &subjects::cluster_shutdown("drain"),
            serde_json::to_vec(&json!({ "phase": "drain", "force": false, "timeout_seconds": 5 }))
                .unwrap()
                .into(),
        )
        .await
        .unwrap();
    let ack = acks.next().await.unwrap();
    let ack: Value = serde_json::from_slice(&ack.payload).unwrap();
    assert_eq!(ack["phase"], "drain");
    assert_eq!(ack["stopped"][0], "i-drain");
    assert_eq!(
        env.daemon.registry.status_of("i-drain").await,
        Some(VmStatus::Stopped)
    );
    assert!(env.daemon.kv.shutdown_marker_exists("node0").await.unwrap());

    // STORAGE and PERSIST stop the managed daemons.
    for phase in ["storage", "persist"] {
        env.bus
            .publish(
                &subjects::cluster_shutdown(phase),
                serde_json::to_vec(&json!({ "phase": phase, "force": false, "timeout_seconds": 5 }))
                    .unwrap()
                    .into(),
            )
            .await
            .unwrap();
        let ack = acks.next().await.unwrap();
        let ack: Value = serde_json::from_slice(&ack.payload).unwrap();
        assert_eq!(ack["phase"], phase);
    }

    // INFRA: subscriptions drop and the daemon asks to exit.
    env.bus
        .publish(
            &subjects::cluster_shutdown("infra"),
            serde_json::to_vec(&json!({ "phase": "infra", "force": false, "timeout_seconds": 5 }))
                .unwrap()
                .into(),
        )
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), env.daemon.wait_exit())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_node_admin_surface() {
    let env = create_env("node0").await;
    seed_running_vm(&env, "i-adm").await;

    let reply = env
        .request(&subjects::admin_health("node0"), &json!({}))
        .await;
    assert_eq!(reply["node"], "node0");
    assert_eq!(reply["vms"][0]["instance_id"], "i-adm");
    assert_eq!(reply["ledger"]["allocated_vcpu"], 2);

    let reply = env.request(subjects::NODE_STATUS, &json!({})).await;
    assert_eq!(reply["vm_count"], 1);

    let reply = env.request(subjects::NODES_DISCOVER, &json!({})).await;
    assert!(reply["available_types"]
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t == "t3.micro"));
}

#[tokio::test]
async fn test_heartbeat_and_manifest() {
    let env = create_env("node0").await;
    cluster::announce(&env.daemon).await.unwrap();

    let task = cluster::spawn_heartbeat_publisher(env.daemon.clone());
    wait_until(|| async {
        env.daemon
            .kv
            .load_heartbeat("node0")
            .await
            .unwrap()
            .is_some()
    })
    .await;
    task.abort();

    let hb = env.daemon.kv.load_heartbeat("node0").await.unwrap().unwrap();
    assert_eq!(hb.node, "node0");
    assert_eq!(hb.total_vcpu, 16);
}
