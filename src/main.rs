use anyhow::{Context, Result};
use clap::Parser;
use hive::bus::NatsBus;
use hive::cluster;
use hive::config::DaemonConfig;
use hive::kv::{JetStreamKv, KvGateway};
use hive::qemu::controller;
use hive::services::Services;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Parser)]
#[command(name = "hived")]
#[command(about = "EC2-compatible virtualization daemon", long_about = None)]
struct Cli {
    /// Node identity, unique within the cluster
    #[arg(long, env = "HIVE_NODE_ID")]
    node_id: String,

    /// Message bus URL
    #[arg(long, env = "HIVE_NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    /// Number of nodes in the cluster (KV replication factor)
    #[arg(long, default_value_t = 1)]
    cluster_size: usize,

    /// Directory for per-VM pid files and QMP sockets
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Cap the vCPUs offered by this node (default: host count)
    #[arg(long)]
    vcpus: Option<u32>,

    /// Cap the memory offered by this node, e.g. "64GiB"
    #[arg(long)]
    memory: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    info!("Starting hive daemon on node {}", cli.node_id);

    let mut config = DaemonConfig::new(cli.node_id, cli.nats_url.clone());
    config.cluster_size = cli.cluster_size;
    config.vcpu_limit = cli.vcpus;
    if let Some(memory) = &cli.memory {
        config.memory_limit_gib = Some(DaemonConfig::parse_memory_gib(memory)?);
    }
    if let Some(run_dir) = cli.run_dir {
        config.run_dir = run_dir;
    }
    std::fs::create_dir_all(&config.run_dir).context("creating run directory")?;

    // The daemon must outlive its hypervisor children under memory
    // pressure; they are killed first.
    controller::protect_daemon_from_oom();

    let bus = Arc::new(
        NatsBus::connect(&cli.nats_url)
            .await
            .context("connecting to the message bus")?,
    );
    let kv_provider = Arc::new(JetStreamKv::new(bus.client().clone()));
    let kv = Arc::new(
        KvGateway::open(kv_provider, config.cluster_size)
            .await
            .context("opening KV buckets")?,
    );

    let services = Services::in_memory();
    let daemon = hive::new_daemon(config, bus, kv, services);

    // Reconcile persisted state with reality before accepting any work.
    hive::recover::run(&daemon).await.context("recovery")?;

    cluster::announce(&daemon).await.context("announcing node")?;
    hive::rpc::bind(&daemon).await.context("binding RPC surface")?;
    cluster::bind(&daemon).await.context("binding shutdown topics")?;
    let heartbeat = cluster::spawn_heartbeat_publisher(daemon.clone());
    daemon.register_topic_task(heartbeat).await;

    info!("Node {} ready", daemon.node_id());

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received");
            cluster::shutdown_on_signal(&daemon).await;
        }
        _ = sigint.recv() => {
            info!("SIGINT received");
            cluster::shutdown_on_signal(&daemon).await;
        }
        _ = daemon.wait_exit() => {
            info!("Exit requested by coordinated shutdown");
        }
    }

    info!("Daemon on node {} exiting", daemon.node_id());
    Ok(())
}
