use crate::config::DaemonConfig;
use crate::error::{HiveError, Result};
use crate::types::{InstanceType, TypeCatalog};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Binds and unbinds the per-type `ec2.RunInstances.<type>` queue-group
/// subscriptions. Implemented by the RPC router.
#[async_trait]
pub trait LaunchSubscriber: Send + Sync {
    async fn subscribe_type(&self, instance_type: &str) -> Result<()>;
    async fn unsubscribe_type(&self, instance_type: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LedgerStats {
    pub total_vcpu: u32,
    pub total_mem_gib: f64,
    pub allocated_vcpu: u32,
    pub allocated_mem_gib: f64,
}

struct Counters {
    total_vcpu: u32,
    total_mem_gib: f64,
    allocated_vcpu: u32,
    allocated_mem_gib: f64,
}

impl Counters {
    fn fits(&self, ty: &InstanceType, n: u64) -> u64 {
        let rem_vcpu = self.total_vcpu.saturating_sub(self.allocated_vcpu) as u64;
        let rem_mem = (self.total_mem_gib - self.allocated_mem_gib).max(0.0);

        let by_vcpu = if ty.vcpus == 0 {
            n
        } else {
            rem_vcpu / ty.vcpus as u64
        };
        let by_mem = if ty.memory_gib() <= 0.0 {
            n
        } else {
            (rem_mem / ty.memory_gib()).floor() as u64
        };
        n.min(by_vcpu).min(by_mem)
    }
}

/// Per-node CPU/memory accounting. After every allocate/deallocate the
/// ledger re-derives which instance-type launch topics this node should be
/// subscribed to, so the bus only routes RunInstances to nodes with room.
pub struct ResourceLedger {
    catalog: TypeCatalog,
    counters: StdMutex<Counters>,
    active: StdMutex<HashSet<String>>,
    subscriber: Mutex<Option<Arc<dyn LaunchSubscriber>>>,
}

impl ResourceLedger {
    pub fn new(catalog: TypeCatalog, total_vcpu: u32, total_mem_gib: f64) -> Self {
        Self {
            catalog,
            counters: StdMutex::new(Counters {
                total_vcpu,
                total_mem_gib,
                allocated_vcpu: 0,
                allocated_mem_gib: 0.0,
            }),
            active: StdMutex::new(HashSet::new()),
            subscriber: Mutex::new(None),
        }
    }

    /// Build from host-discovered totals, honoring config overrides. The
    /// host is only probed for totals the config leaves unset.
    pub fn from_host(catalog: TypeCatalog, config: &DaemonConfig) -> Self {
        let (vcpus, mem_gib) = match (config.vcpu_limit, config.memory_limit_gib) {
            (Some(v), Some(m)) => (v, m),
            (v, m) => {
                let sys = sysinfo::System::new_all();
                (
                    v.unwrap_or(sys.cpus().len() as u32),
                    m.unwrap_or(sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0)),
                )
            }
        };

        Self::new(catalog, vcpus, mem_gib)
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Install the subscription manager and bring the per-type topics in
    /// line with current capacity.
    pub async fn bind_subscriber(&self, subscriber: Arc<dyn LaunchSubscriber>) -> Result<()> {
        *self.subscriber.lock().await = Some(subscriber);
        self.update_subscriptions().await
    }

    /// How many instances of `ty` fit right now, clamped to `n`.
    pub fn can_allocate(&self, ty: &InstanceType, n: u64) -> u64 {
        self.counters.lock().unwrap().fits(ty, n)
    }

    pub fn can_allocate_name(&self, type_name: &str, n: u64) -> Result<u64> {
        let ty = self
            .catalog
            .get(type_name)
            .ok_or_else(|| HiveError::UnknownInstanceType(type_name.to_string()))?;
        Ok(self.can_allocate(ty, n))
    }

    /// Check and increment under one lock acquisition, then reconcile the
    /// launch subscriptions.
    pub async fn allocate(&self, type_name: &str) -> Result<()> {
        let ty = self
            .catalog
            .get(type_name)
            .ok_or_else(|| HiveError::UnknownInstanceType(type_name.to_string()))?;
        {
            let mut c = self.counters.lock().unwrap();
            if c.fits(ty, 1) < 1 {
                return Err(HiveError::InsufficientCapacity(type_name.to_string()));
            }
            c.allocated_vcpu += ty.vcpus;
            c.allocated_mem_gib += ty.memory_gib();
        }
        debug!("Allocated {} ({} vCPU)", type_name, ty.vcpus);
        self.update_subscriptions().await
    }

    pub async fn deallocate(&self, type_name: &str) -> Result<()> {
        let ty = self
            .catalog
            .get(type_name)
            .ok_or_else(|| HiveError::UnknownInstanceType(type_name.to_string()))?;
        {
            let mut c = self.counters.lock().unwrap();
            if c.allocated_vcpu < ty.vcpus || c.allocated_mem_gib < ty.memory_gib() {
                warn!("Deallocate of {} would underflow the ledger", type_name);
            }
            c.allocated_vcpu = c.allocated_vcpu.saturating_sub(ty.vcpus);
            c.allocated_mem_gib = (c.allocated_mem_gib - ty.memory_gib()).max(0.0);
        }
        debug!("Deallocated {}", type_name);
        self.update_subscriptions().await
    }

    pub fn stats(&self) -> LedgerStats {
        let c = self.counters.lock().unwrap();
        LedgerStats {
            total_vcpu: c.total_vcpu,
            total_mem_gib: c.total_mem_gib,
            allocated_vcpu: c.allocated_vcpu,
            allocated_mem_gib: c.allocated_mem_gib,
        }
    }

    /// The instance types that currently fit. With `show_capacity` each type
    /// repeats once per fitting slot; otherwise each appears at most once.
    pub fn available_types(&self, show_capacity: bool) -> Vec<InstanceType> {
        let mut out = Vec::new();
        for ty in self.catalog.iter() {
            let slots = self.can_allocate(ty, u64::MAX);
            if slots == 0 {
                continue;
            }
            if show_capacity {
                for _ in 0..slots {
                    out.push(ty.clone());
                }
            } else {
                out.push(ty.clone());
            }
        }
        out
    }

    /// Reconcile the per-type launch subscriptions with current capacity:
    /// subscribe types that fit, drop types that no longer do. The
    /// subscriber guard is held across the sweep so concurrent
    /// allocate/deallocate calls reconcile one at a time.
    pub async fn update_subscriptions(&self) -> Result<()> {
        let guard = self.subscriber.lock().await;
        let subscriber = match guard.clone() {
            Some(s) => s,
            None => return Ok(()),
        };

        for ty in self.catalog.iter() {
            let fits = self.can_allocate(ty, 1) >= 1;
            let subscribed = self.active.lock().unwrap().contains(&ty.name);

            if fits && !subscribed {
                subscriber.subscribe_type(&ty.name).await?;
                self.active.lock().unwrap().insert(ty.name.clone());
            } else if !fits && subscribed {
                subscriber.unsubscribe_type(&ty.name).await?;
                self.active.lock().unwrap().remove(&ty.name);
            }
        }
        Ok(())
    }

    /// Types with an active launch subscription. Test observability.
    pub fn subscribed_types(&self) -> HashSet<String> {
        self.active.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn small_catalog() -> TypeCatalog {
        TypeCatalog::builtin()
    }

    #[derive(Default)]
    struct RecordingSubscriber {
        subscribed: StdMutex<HashSet<String>>,
    }

    #[async_trait]
    impl LaunchSubscriber for RecordingSubscriber {
        async fn subscribe_type(&self, instance_type: &str) -> Result<()> {
            self.subscribed
                .lock()
                .unwrap()
                .insert(instance_type.to_string());
            Ok(())
        }

        async fn unsubscribe_type(&self, instance_type: &str) -> Result<()> {
            self.subscribed
                .lock()
                .unwrap()
                .remove(instance_type);
            Ok(())
        }
    }

    #[test]
    fn test_can_allocate_clamps() {
        let ledger = ResourceLedger::new(small_catalog(), 4, 4.0);
        let micro = ledger.catalog().get("t3.micro").unwrap().clone();
        // 4 vCPU allows 2 micros; 4 GiB allows 4. vCPU is the bound.
        assert_eq!(ledger.can_allocate(&micro, 10), 2);
        assert_eq!(ledger.can_allocate(&micro, 1), 1);

        let xlarge = ledger.catalog().get("t3.xlarge").unwrap().clone();
        assert_eq!(ledger.can_allocate(&xlarge, 1), 0);
    }

    #[tokio::test]
    async fn test_allocation_accounting() {
        let ledger = ResourceLedger::new(small_catalog(), 16, 64.0);

        ledger.allocate("t3.micro").await.unwrap();
        ledger.allocate("t3.medium").await.unwrap();
        ledger.allocate("m5.large").await.unwrap();

        let stats = ledger.stats();
        assert_eq!(stats.allocated_vcpu, 6);
        assert_eq!(stats.allocated_mem_gib, 1.0 + 4.0 + 8.0);

        ledger.deallocate("t3.medium").await.unwrap();
        let stats = ledger.stats();
        assert_eq!(stats.allocated_vcpu, 4);
        assert_eq!(stats.allocated_mem_gib, 9.0);
    }

    #[tokio::test]
    async fn test_allocate_refuses_when_full() {
        let ledger = ResourceLedger::new(small_catalog(), 2, 1.0);
        ledger.allocate("t3.micro").await.unwrap();
        let err = ledger.allocate("t3.micro").await.unwrap_err();
        assert!(matches!(err, HiveError::InsufficientCapacity(_)));
        assert_eq!(ledger.stats().allocated_vcpu, 2);
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let ledger = ResourceLedger::new(small_catalog(), 2, 1.0);
        assert!(matches!(
            ledger.allocate("z1d.metal").await.unwrap_err(),
            HiveError::UnknownInstanceType(_)
        ));
    }

    #[tokio::test]
    async fn test_subscriptions_track_capacity() {
        // Room for exactly one t3.micro and nothing bigger.
        let ledger = ResourceLedger::new(small_catalog(), 2, 1.0);
        let sub = Arc::new(RecordingSubscriber::default());
        ledger.bind_subscriber(sub.clone()).await.unwrap();

        {
            let subscribed = sub.subscribed.lock().unwrap();
            assert!(subscribed.contains("t3.nano"));
            assert!(subscribed.contains("t3.micro"));
            assert!(!subscribed.contains("t3.small"));
        }

        // Fill the node: every topic must drop.
        ledger.allocate("t3.micro").await.unwrap();
        assert!(sub.subscribed.lock().unwrap().is_empty());
        assert!(ledger.subscribed_types().is_empty());

        // Free it again: topics come back.
        ledger.deallocate("t3.micro").await.unwrap();
        assert!(sub.subscribed.lock().unwrap().contains("t3.micro"));
    }

    /// For every catalog type, a subscription exists iff one instance fits.
    #[tokio::test]
    async fn test_subscription_invariant_across_sequences() {
        let ledger = ResourceLedger::new(small_catalog(), 8, 16.0);
        let sub = Arc::new(RecordingSubscriber::default());
        ledger.bind_subscriber(sub.clone()).await.unwrap();

        let ops: Vec<(&str, bool)> = vec![
            ("t3.medium", true),
            ("t3.xlarge", true),
            ("t3.medium", false),
            ("m5.large", true),
            ("t3.xlarge", false),
        ];

        for (ty, alloc) in ops {
            if alloc {
                ledger.allocate(ty).await.unwrap();
            } else {
                ledger.deallocate(ty).await.unwrap();
            }

            for ty in ledger.catalog().iter() {
                let fits = ledger.can_allocate(ty, 1) >= 1;
                let subscribed = ledger.subscribed_types().contains(&ty.name);
                assert_eq!(fits, subscribed, "type {}", ty.name);
            }
        }
    }

    #[test]
    fn test_available_types_capacity_expansion() {
        let ledger = ResourceLedger::new(small_catalog(), 4, 2.0);

        let collapsed = ledger.available_types(false);
        let names: Vec<&str> = collapsed.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"t3.nano"));
        assert!(names.contains(&"t3.micro"));
        assert!(!names.contains(&"t3.2xlarge"));
        // Each at most once.
        let unique: HashSet<&&str> = names.iter().collect();
        assert_eq!(unique.len(), names.len());

        let expanded = ledger.available_types(true);
        let nano_slots = expanded.iter().filter(|t| t.name == "t3.nano").count();
        // 2 GiB / 0.5 GiB = 4 slots, 4 vCPU / 2 = 2 slots; vCPU binds.
        assert_eq!(nano_slots, 2);
    }
}
