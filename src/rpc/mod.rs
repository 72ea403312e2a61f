//! Bus-facing dispatch: the capacity-gated launch topics, the shared EC2
//! verbs, and the admin surface. Per-instance command topics are installed
//! by the launch and recovery paths.

pub mod api;
pub mod handlers;
pub mod launch;

use crate::bus::{subjects, BusMessage};
use crate::config::WORKER_QUEUE_GROUP;
use crate::daemon::Daemon;
use crate::error::{HiveError, Result};
use crate::ledger::LaunchSubscriber;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::info;

/// Verbs forwarded untouched to the backing services.
pub const PASSTHROUGH_VERBS: &[&str] = &[
    "CreateVolume",
    "DescribeVolumes",
    "ModifyVolume",
    "DeleteVolume",
    "DescribeVolumeStatus",
    "CreateSnapshot",
    "DescribeSnapshots",
    "DeleteSnapshot",
    "CopySnapshot",
    "CreateTags",
    "DeleteTags",
    "DescribeTags",
    "CreateKeyPair",
    "DeleteKeyPair",
    "DescribeKeyPairs",
    "ImportKeyPair",
    "CreateVpc",
    "DescribeVpcs",
    "DeleteVpc",
    "CreateEgressOnlyInternetGateway",
    "DescribeEgressOnlyInternetGateways",
    "DeleteEgressOnlyInternetGateway",
];

/// The ledger's view of the per-type launch topics. Subscribing spawns a
/// queue-group consumer; unsubscribing aborts it.
pub struct LaunchTopics {
    daemon: Weak<Daemon>,
}

impl LaunchTopics {
    pub fn new(daemon: &Arc<Daemon>) -> Self {
        Self {
            daemon: Arc::downgrade(daemon),
        }
    }
}

#[async_trait]
impl LaunchSubscriber for LaunchTopics {
    async fn subscribe_type(&self, instance_type: &str) -> Result<()> {
        let daemon = self
            .daemon
            .upgrade()
            .ok_or_else(|| HiveError::Bus("daemon is gone".to_string()))?;

        let subject = subjects::run_instances(instance_type);
        let mut sub = daemon
            .bus
            .queue_subscribe(&subject, WORKER_QUEUE_GROUP)
            .await?;

        let ty = instance_type.to_string();
        let worker = daemon.clone();
        let (cancel, mut cancelled) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = sub.next() => match msg {
                        Some(msg) => handlers::handle_run_instances(&worker, &ty, msg).await,
                        None => break,
                    },
                    _ = &mut cancelled => break,
                }
            }
        });
        daemon
            .register_launch_task(instance_type, crate::daemon::LaunchTask { task, cancel })
            .await;
        info!("Accepting launches for {}", instance_type);
        Ok(())
    }

    async fn unsubscribe_type(&self, instance_type: &str) -> Result<()> {
        if let Some(daemon) = self.daemon.upgrade() {
            daemon.cancel_launch_task(instance_type).await;
            info!("No longer accepting launches for {}", instance_type);
        }
        Ok(())
    }
}

async fn bind_queue<F, Fut>(daemon: &Arc<Daemon>, subject: &str, handler: F) -> Result<()>
where
    F: Fn(Arc<Daemon>, BusMessage) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut sub = daemon
        .bus
        .queue_subscribe(subject, WORKER_QUEUE_GROUP)
        .await?;
    let worker = daemon.clone();
    let task = tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            handler(worker.clone(), msg).await;
        }
    });
    daemon.register_topic_task(task).await;
    Ok(())
}

async fn bind_fanout<F, Fut>(daemon: &Arc<Daemon>, subject: &str, handler: F) -> Result<()>
where
    F: Fn(Arc<Daemon>, BusMessage) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut sub = daemon.bus.subscribe(subject).await?;
    let worker = daemon.clone();
    let task = tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            handler(worker.clone(), msg).await;
        }
    });
    daemon.register_topic_task(task).await;
    Ok(())
}

/// Bind every RPC topic. Runs after recovery so no request observes a
/// half-restored registry.
pub async fn bind(daemon: &Arc<Daemon>) -> Result<()> {
    // Capacity-gated RunInstances topics, kept in sync by the ledger.
    daemon
        .ledger
        .bind_subscriber(Arc::new(LaunchTopics::new(daemon)))
        .await?;

    bind_queue(daemon, subjects::EC2_START, |d, m| async move {
        handlers::handle_start(&d, m).await
    })
    .await?;
    bind_queue(daemon, subjects::EC2_TERMINATE, |d, m| async move {
        handlers::handle_terminate(&d, m).await
    })
    .await?;
    bind_queue(daemon, subjects::DESCRIBE_STOPPED_INSTANCES, |d, m| async move {
        handlers::handle_describe_stopped_instances(&d, m).await
    })
    .await?;
    bind_queue(daemon, subjects::MODIFY_INSTANCE_ATTRIBUTE, |d, m| async move {
        handlers::handle_modify_instance_attribute(&d, m).await
    })
    .await?;
    bind_queue(daemon, subjects::CREATE_IMAGE, |d, m| async move {
        handlers::handle_create_image(&d, m).await
    })
    .await?;

    // Describe verbs fan out; an upstream gateway aggregates the replies.
    bind_fanout(daemon, subjects::DESCRIBE_INSTANCES, |d, m| async move {
        handlers::handle_describe_instances(&d, m).await
    })
    .await?;
    bind_fanout(daemon, subjects::DESCRIBE_INSTANCE_TYPES, |d, m| async move {
        handlers::handle_describe_instance_types(&d, m).await
    })
    .await?;

    for &verb in PASSTHROUGH_VERBS {
        let subject = format!("ec2.{}", verb);
        bind_queue(daemon, &subject, move |d, m| async move {
            handlers::handle_passthrough(&d, verb, m).await
        })
        .await?;
    }

    // Admin surface.
    bind_fanout(
        daemon,
        &subjects::admin_health(daemon.node_id()),
        |d, m| async move { handlers::handle_admin_health(&d, m).await },
    )
    .await?;
    bind_fanout(daemon, subjects::NODES_DISCOVER, |d, m| async move {
        handlers::handle_nodes_discover(&d, m).await
    })
    .await?;
    bind_fanout(daemon, subjects::NODE_STATUS, |d, m| async move {
        handlers::handle_node_status(&d, m).await
    })
    .await?;
    bind_fanout(daemon, subjects::NODE_VMS, |d, m| async move {
        handlers::handle_node_vms(&d, m).await
    })
    .await?;

    // Surviving VMs from recovery need their command topics back.
    for id in daemon.registry.ids().await {
        if daemon.registry.status_of(&id).await == Some(crate::instance::VmStatus::Running) {
            daemon.install_cmd_subscription(&id).await?;
        }
    }

    info!("RPC surface bound");
    Ok(())
}
