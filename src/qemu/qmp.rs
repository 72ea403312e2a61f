use crate::error::{HiveError, Result};
use crate::instance::Registry;
use crate::volume::BlockUri;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A serialized QMP command channel. The concrete client talks to the
/// hypervisor's unix socket; tests substitute fakes.
#[async_trait]
pub trait QmpSession: Send + Sync {
    /// Send one command and block until its `return` envelope arrives.
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value>;

    /// Drop the connection. Subsequent executes fail.
    async fn close(&self);
}

struct QmpIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One duplex QMP connection per VM.
///
/// Commands are serialized by the internal lock. Messages tagged `event`
/// are logged and skipped: state is driven by the initiating command
/// handler, never by events, which avoids event/command races.
pub struct QmpClient {
    io: Mutex<Option<QmpIo>>,
}

impl QmpClient {
    /// Connect and perform the capabilities handshake.
    pub async fn connect(socket: &Path) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            HiveError::QemuFailed(format!("QMP connect to {}: {}", socket.display(), e))
        })?;
        let (read, write) = stream.into_split();
        let mut io = QmpIo {
            reader: BufReader::new(read),
            writer: write,
        };

        // Greeting banner, then capability negotiation.
        let greeting = Self::read_message(&mut io.reader).await?;
        if greeting.get("QMP").is_none() {
            return Err(HiveError::QemuFailed(format!(
                "unexpected QMP greeting: {}",
                greeting
            )));
        }

        let client = Self {
            io: Mutex::new(Some(io)),
        };
        client.execute("qmp_capabilities", None).await?;
        debug!("QMP handshake complete on {}", socket.display());
        Ok(Arc::new(client))
    }

    async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<Value> {
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(HiveError::QemuFailed(
                    "QMP connection closed by peer".to_string(),
                ));
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(line)?);
        }
    }
}

#[async_trait]
impl QmpSession for QmpClient {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .ok_or_else(|| HiveError::QemuFailed("QMP connection is closed".to_string()))?;

        let mut envelope = json!({ "execute": command });
        if let Some(args) = arguments {
            envelope["arguments"] = args;
        }
        let mut wire = serde_json::to_vec(&envelope)?;
        wire.push(b'\n');
        io.writer.write_all(&wire).await?;

        // Read until the matching return; events are interleaved freely.
        loop {
            let msg = Self::read_message(&mut io.reader).await?;
            if let Some(event) = msg.get("event") {
                debug!("QMP event: {}", event);
                continue;
            }
            if let Some(err) = msg.get("error") {
                let class = err
                    .get("class")
                    .and_then(Value::as_str)
                    .unwrap_or("GenericError")
                    .to_string();
                let desc = err
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown QMP failure")
                    .to_string();
                return Err(HiveError::Qmp { class, desc });
            }
            if let Some(ret) = msg.get("return") {
                return Ok(ret.clone());
            }
            warn!("Unrecognized QMP message: {}", msg);
        }
    }

    async fn close(&self) {
        self.io.lock().await.take();
    }
}

// --- typed commands ---

#[derive(Debug, serde::Deserialize)]
pub struct StatusInfo {
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

pub async fn query_status(qmp: &dyn QmpSession) -> Result<StatusInfo> {
    let ret = qmp.execute("query-status", None).await?;
    Ok(serde_json::from_value(ret)?)
}

pub async fn query_block(qmp: &dyn QmpSession) -> Result<Value> {
    qmp.execute("query-block", None).await
}

pub async fn system_powerdown(qmp: &dyn QmpSession) -> Result<()> {
    qmp.execute("system_powerdown", None).await.map(|_| ())
}

/// Expose an NBD export to the hypervisor as a named block node.
pub async fn blockdev_add_nbd(qmp: &dyn QmpSession, node_name: &str, uri: &BlockUri) -> Result<()> {
    qmp.execute(
        "blockdev-add",
        Some(json!({
            "driver": "nbd",
            "node-name": node_name,
            "server": uri.qmp_server(),
            "export": uri.export(),
        })),
    )
    .await
    .map(|_| ())
}

pub async fn blockdev_del(qmp: &dyn QmpSession, node_name: &str) -> Result<()> {
    qmp.execute("blockdev-del", Some(json!({ "node-name": node_name })))
        .await
        .map(|_| ())
}

/// Hot-plug a virtio disk onto one of the reserved root ports.
pub async fn device_add_disk(
    qmp: &dyn QmpSession,
    id: &str,
    drive_node: &str,
    bus: &str,
) -> Result<()> {
    qmp.execute(
        "device_add",
        Some(json!({
            "driver": "virtio-blk-pci",
            "id": id,
            "drive": drive_node,
            "bus": bus,
        })),
    )
    .await
    .map(|_| ())
}

pub async fn device_del(qmp: &dyn QmpSession, id: &str) -> Result<()> {
    qmp.execute("device_del", Some(json!({ "id": id })))
        .await
        .map(|_| ())
}

/// Periodic liveness probe for one VM's QMP connection. Exits, closing the
/// connection, once the VM reaches a state with no hypervisor to probe.
/// Transient probe failures keep the loop alive.
pub fn spawn_heartbeat(
    registry: Arc<Registry>,
    instance_id: String,
    qmp: Arc<dyn QmpSession>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let status = registry.status_of(&instance_id).await;
            match status {
                Some(s) if !s.is_terminal_for_qmp() => {
                    if let Err(e) = query_status(qmp.as_ref()).await {
                        warn!("QMP heartbeat for {} failed: {}", instance_id, e);
                    }
                }
                _ => {
                    info!("QMP heartbeat for {} exiting", instance_id);
                    qmp.close().await;
                    return;
                }
            }
        }
    })
}


#[cfg(test)]
mod tests {
    use super::testing::FakeQmp;
    use super::*;
    use crate::instance::{Registry, VmRecord, VmStatus};

    #[tokio::test]
    async fn test_typed_commands_use_expected_names() {
        let qmp = FakeQmp::new();
        query_status(qmp.as_ref()).await.unwrap();
        system_powerdown(qmp.as_ref()).await.unwrap();
        device_del(qmp.as_ref(), "vdisk-vol-1").await.unwrap();
        assert_eq!(
            qmp.commands(),
            vec!["query-status", "system_powerdown", "device_del"]
        );
    }

    #[tokio::test]
    async fn test_error_envelope_becomes_typed_error() {
        let qmp = FakeQmp::new();
        qmp.fail_on("blockdev-del");
        let err = blockdev_del(qmp.as_ref(), "nbd-vol-1").await.unwrap_err();
        assert!(matches!(err, HiveError::Qmp { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_exits_on_terminal_state() {
        let registry = Arc::new(Registry::new("node0"));
        let mut vm = VmRecord::new("i-1", "r-1", "t3.micro", "ami-1");
        vm.apply_status(VmStatus::Running);
        registry.insert(vm).await.unwrap();

        let qmp = FakeQmp::new();
        let handle = spawn_heartbeat(
            registry.clone(),
            "i-1".to_string(),
            qmp.clone(),
            Duration::from_secs(30),
        );

        // One interval with a running VM: probe issued, loop continues.
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(qmp.commands().contains(&"query-status".to_string()));

        // Flip to a terminal state: next tick closes and exits.
        registry.force_status("i-1", VmStatus::Stopping).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        handle.await.unwrap();
        assert!(*qmp.closed.lock().unwrap());
    }
}
