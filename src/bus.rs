use crate::error::{HiveError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Bus topic names.
pub mod subjects {
    /// Capacity-gated launch topic, one per instance type.
    pub fn run_instances(instance_type: &str) -> String {
        format!("ec2.RunInstances.{}", instance_type)
    }

    /// Targeted command topic owned by the node running the instance.
    pub fn instance_cmd(instance_id: &str) -> String {
        format!("ec2.cmd.{}", instance_id)
    }

    pub fn ebs_mount(node: &str) -> String {
        format!("ebs.{}.mount", node)
    }

    pub fn ebs_unmount(node: &str) -> String {
        format!("ebs.{}.unmount", node)
    }

    pub fn ebs_sync(node: &str) -> String {
        format!("ebs.{}.sync", node)
    }

    pub const EBS_DELETE: &str = "ebs.delete";

    pub const EC2_START: &str = "ec2.start";
    pub const EC2_TERMINATE: &str = "ec2.terminate";
    pub const DESCRIBE_INSTANCES: &str = "ec2.DescribeInstances";
    pub const DESCRIBE_INSTANCE_TYPES: &str = "ec2.DescribeInstanceTypes";
    pub const DESCRIBE_STOPPED_INSTANCES: &str = "ec2.DescribeStoppedInstances";
    pub const MODIFY_INSTANCE_ATTRIBUTE: &str = "ec2.ModifyInstanceAttribute";
    pub const CREATE_IMAGE: &str = "ec2.CreateImage";

    pub fn admin_health(node: &str) -> String {
        format!("hive.admin.{}.health", node)
    }

    pub const NODES_DISCOVER: &str = "hive.nodes.discover";
    pub const NODE_STATUS: &str = "hive.node.status";
    pub const NODE_VMS: &str = "hive.node.vms";

    pub fn cluster_shutdown(phase: &str) -> String {
        format!("hive.cluster.shutdown.{}", phase)
    }

    pub const SHUTDOWN_PROGRESS: &str = "hive.cluster.shutdown.progress";
    pub const SHUTDOWN_ACK: &str = "hive.cluster.shutdown.ack";
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
    pub reply: Option<String>,
}

/// Live subscription handle. Dropping it (or calling `unsubscribe`) stops
/// delivery.
pub struct Subscription {
    rx: mpsc::Receiver<BusMessage>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    fn new(rx: mpsc::Receiver<BusMessage>, task: Option<tokio::task::JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Request/reply and pub/sub transport with queue-group semantics.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Request/reply with an explicit deadline.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes>;

    /// Fan-out subscription: every subscriber receives a copy.
    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    /// Queue-group subscription: one subscriber in the group receives each
    /// message.
    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription>;
}

/// Serialize and publish a reply to the message's reply subject, if any.
pub async fn respond<T: Serialize>(
    bus: &dyn MessageBus,
    msg: &BusMessage,
    value: &T,
) -> Result<()> {
    if let Some(reply) = &msg.reply {
        let payload = serde_json::to_vec(value)?;
        bus.publish(reply, payload.into()).await?;
    }
    Ok(())
}

/// JSON request helper.
pub async fn request_json<Req: Serialize, Resp: DeserializeOwned>(
    bus: &dyn MessageBus,
    subject: &str,
    req: &Req,
    timeout: Duration,
) -> Result<Resp> {
    let payload = serde_json::to_vec(req)?;
    let reply = bus.request(subject, payload.into(), timeout).await?;
    Ok(serde_json::from_slice(&reply)?)
}

/// NATS-backed bus.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| HiveError::Bus(format!("connect to {}: {}", url, e)))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn forward(mut sub: async_nats::Subscriber) -> Subscription {
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let out = BusMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload,
                    reply: msg.reply.map(|r| r.to_string()),
                };
                if tx.send(out).await.is_err() {
                    break;
                }
            }
        });
        Subscription::new(rx, Some(task))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| HiveError::Bus(format!("publish {}: {}", subject, e)))
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        let fut = self.client.request(subject.to_string(), payload);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(msg)) => Ok(msg.payload),
            Ok(Err(e)) => Err(HiveError::Bus(format!("request {}: {}", subject, e))),
            Err(_) => Err(HiveError::BusTimeout {
                subject: subject.to_string(),
            }),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| HiveError::Bus(format!("subscribe {}: {}", subject, e)))?;
        Ok(Self::forward(sub))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription> {
        let sub = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| HiveError::Bus(format!("queue subscribe {}: {}", subject, e)))?;
        Ok(Self::forward(sub))
    }
}

type SubscriberList = Vec<mpsc::Sender<BusMessage>>;

#[derive(Default)]
struct MemoryBusState {
    fanout: HashMap<String, SubscriberList>,
    // (subject, group) -> senders; delivery is round-robin within the group
    groups: HashMap<(String, String), SubscriberList>,
    inflight: HashMap<String, oneshot::Sender<Bytes>>,
}

/// In-process bus with the same delivery semantics, for tests.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<MemoryBusState>,
    rr: AtomicUsize,
    inbox_seq: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, subject: &str, payload: Bytes, reply: Option<String>) {
        let mut state = self.state.lock().unwrap();

        // A reply to an in-flight request?
        if let Some(tx) = state.inflight.remove(subject) {
            let _ = tx.send(payload);
            return;
        }

        if let Some(subs) = state.fanout.get_mut(subject) {
            subs.retain(|tx| {
                tx.try_send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: reply.clone(),
                })
                .is_ok()
            });
        }

        let group_keys: Vec<(String, String)> = state
            .groups
            .keys()
            .filter(|(s, _)| s == subject)
            .cloned()
            .collect();
        for key in group_keys {
            let rr = self.rr.fetch_add(1, Ordering::Relaxed);
            if let Some(subs) = state.groups.get_mut(&key) {
                subs.retain(|tx| !tx.is_closed());
                if subs.is_empty() {
                    continue;
                }
                let tx = &subs[rr % subs.len()];
                let _ = tx.try_send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: reply.clone(),
                });
            }
        }
    }

    /// Whether any queue-group subscriber is bound to the subject. Test
    /// helper for capacity-gated subscription checks.
    pub fn has_queue_subscriber(&self, subject: &str, group: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state
            .groups
            .get_mut(&(subject.to_string(), group.to_string()))
        {
            Some(subs) => {
                subs.retain(|tx| !tx.is_closed());
                !subs.is_empty()
            }
            None => false,
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.deliver(subject, payload, None);
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        let inbox = format!("_inbox.{}", self.inbox_seq.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .inflight
            .insert(inbox.clone(), tx);

        self.deliver(subject, payload, Some(inbox.clone()));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            _ => {
                self.state.lock().unwrap().inflight.remove(&inbox);
                Err(HiveError::BusTimeout {
                    subject: subject.to_string(),
                })
            }
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(256);
        self.state
            .lock()
            .unwrap()
            .fanout
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx, None))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(256);
        self.state
            .lock()
            .unwrap()
            .groups
            .entry((subject.to_string(), group.to_string()))
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx, None))
    }
}
