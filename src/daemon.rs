use crate::bus::MessageBus;
use crate::config::DaemonConfig;
use crate::instance::Registry;
use crate::kv::KvGateway;
use crate::ledger::ResourceLedger;
use crate::services::Services;
use crate::types::TypeCatalog;
use crate::volume::{boot::BootVolumeBuilder, VolumeBinder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A per-type launch consumer. Cancellation is graceful: dropping the
/// sender stops message delivery while an in-flight handler (possibly the
/// one whose allocation just exhausted capacity) runs to completion.
pub struct LaunchTask {
    pub task: JoinHandle<()>,
    pub cancel: oneshot::Sender<()>,
}

/// Process-wide state: the registry, the ledger, the KV gateway, the bus
/// connection, and the subscription bookkeeping. Created once by
/// [`new_daemon`]; torn down by the signal handler or the INFRA shutdown
/// phase.
pub struct Daemon {
    pub config: DaemonConfig,
    pub registry: Arc<Registry>,
    pub ledger: Arc<ResourceLedger>,
    pub kv: Arc<KvGateway>,
    pub bus: Arc<dyn MessageBus>,
    pub services: Services,
    pub binder: Arc<VolumeBinder>,
    pub boot_builder: Arc<BootVolumeBuilder>,
    /// Per-VM command subscription tasks, keyed by instance id.
    cmd_subs: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Per-type launch subscription tasks, keyed by instance type.
    launch_subs: Mutex<HashMap<String, LaunchTask>>,
    /// Remaining topic handler tasks (describe, admin, cluster phases).
    topic_subs: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    exit: tokio::sync::Notify,
}

/// Assemble the daemon from its collaborators. The registry starts empty;
/// the recoverer fills it before any RPC subscription binds.
pub fn new_daemon(
    config: DaemonConfig,
    bus: Arc<dyn MessageBus>,
    kv: Arc<KvGateway>,
    services: Services,
) -> Arc<Daemon> {
    let catalog = TypeCatalog::builtin();
    let registry = Arc::new(Registry::new(config.node_id.clone()));
    let ledger = Arc::new(ResourceLedger::from_host(catalog, &config));
    let binder = Arc::new(VolumeBinder::new(
        bus.clone(),
        services.volumes.clone(),
        config.node_id.clone(),
        config.detach_delay,
    ));
    let boot_builder = Arc::new(BootVolumeBuilder::new(services.clone()));

    Arc::new(Daemon {
        config,
        registry,
        ledger,
        kv,
        bus,
        services,
        binder,
        boot_builder,
        cmd_subs: Mutex::new(HashMap::new()),
        launch_subs: Mutex::new(HashMap::new()),
        topic_subs: Mutex::new(Vec::new()),
        shutting_down: AtomicBool::new(false),
        exit: tokio::sync::Notify::new(),
    })
}

impl Daemon {
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Set by the GATE phase (and the signal handler); subsequent work is
    /// refused and the crash restarter stands down.
    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Ask the main loop to exit the process. The permit is stored, so a
    /// request before the main loop starts waiting is not lost.
    pub fn request_exit(&self) {
        self.exit.notify_one();
    }

    pub async fn wait_exit(&self) {
        self.exit.notified().await;
    }

    pub fn install_cmd_subscription<'a>(
        self: &'a Arc<Self>,
        instance_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut subs = self.cmd_subs.lock().await;
            if subs.contains_key(instance_id) {
                return Ok(());
            }

            let subject = crate::bus::subjects::instance_cmd(instance_id);
            let sub = self.bus.subscribe(&subject).await?;
            let daemon = self.clone();
            let id = instance_id.to_string();
            let task = tokio::spawn(Self::run_cmd_subscription(daemon, id, sub));
            subs.insert(instance_id.to_string(), task);
            debug!("Installed command subscription for {}", instance_id);
            Ok(())
        })
    }

    async fn run_cmd_subscription(daemon: Arc<Self>, id: String, mut sub: crate::bus::Subscription) {
        while let Some(msg) = sub.next().await {
            crate::rpc::handlers::handle_instance_command(&daemon, &id, msg).await;
        }
    }

    pub async fn cancel_cmd_subscription(&self, instance_id: &str) {
        if let Some(task) = self.cmd_subs.lock().await.remove(instance_id) {
            task.abort();
            debug!("Cancelled command subscription for {}", instance_id);
        }
    }

    pub async fn has_cmd_subscription(&self, instance_id: &str) -> bool {
        self.cmd_subs.lock().await.contains_key(instance_id)
    }

    pub async fn register_launch_task(&self, instance_type: &str, launch: LaunchTask) {
        if let Some(old) = self
            .launch_subs
            .lock()
            .await
            .insert(instance_type.to_string(), launch)
        {
            old.task.abort();
        }
    }

    /// Stop accepting launches for a type. The dropped cancel sender ends
    /// the consumer loop between messages.
    pub async fn cancel_launch_task(&self, instance_type: &str) {
        drop(self.launch_subs.lock().await.remove(instance_type));
    }

    pub async fn register_topic_task(&self, task: JoinHandle<()>) {
        self.topic_subs.lock().await.push(task);
    }

    /// Drop every subscription; used by the INFRA phase and final teardown.
    pub async fn unsubscribe_all(&self) {
        for (_, task) in self.cmd_subs.lock().await.drain() {
            task.abort();
        }
        for (_, launch) in self.launch_subs.lock().await.drain() {
            launch.task.abort();
        }
        for task in self.topic_subs.lock().await.drain(..) {
            task.abort();
        }
        info!("All bus subscriptions dropped");
    }
}
