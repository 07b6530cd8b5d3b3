//! Process bookkeeping for a node.
//!
//! - [`ProcessRegistry`]: live-process sets and worker runtime records
//! - [`Maintainer`]: culls dead processes of this node, recovers their
//!   buffers and reports the capacity still missing against a [`PoolLayout`]
//! - [`PoolMaintainer`]: grows or shrinks the units of a batch pool
//!
//! Spawning replacement processes is left to the external supervisor; the
//! maintainer only says how many are missing.

mod rebalance;
mod registry;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::PoolLayout;
use crate::error::MaintainerError;
use crate::identity::{AllocatorImage, ProcessIdentity, SchedulerImage, WorkerImage};
use crate::metrics::MetricsCollector;
use crate::store::{keys, KeyValueStore};
use crate::worker::recover_buffer;

pub use self::rebalance::{PoolMaintainer, RebalanceReport};
pub use self::registry::{ProcessRegistry, RuntimeState};

/// Checks whether an OS process is alive.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by `/proc/<pid>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProcessProbe;

#[async_trait]
impl ProcessProbe for LocalProcessProbe {
    async fn is_alive(&self, pid: u32) -> bool {
        tokio::fs::try_exists(format!("/proc/{pid}"))
            .await
            .unwrap_or(false)
    }
}

/// Kind of process a capacity line refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessKind {
    Worker,
    Allocator,
    Scheduler,
}

/// Running versus desired processes for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capacity {
    pub kind: ProcessKind,
    /// Queue or pool name; empty for the scheduler.
    pub pool: String,
    /// Worker code (`u<unit>` for pool units).
    pub code: Option<String>,
    pub running: u32,
    pub desired: u32,
}

impl Capacity {
    pub fn missing(&self) -> u32 {
        self.desired.saturating_sub(self.running)
    }

    pub fn excess(&self) -> u32 {
        self.running.saturating_sub(self.desired)
    }
}

/// Outcome of one [`Maintainer::reconcile`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ids of dead processes removed from the registry.
    pub culled: Vec<String>,
    /// Payloads moved to `orphaned_jobs`.
    pub recovered: usize,
    /// Queues dropped from the queue registry.
    pub deregistered_queues: Vec<String>,
    pub capacity: Vec<Capacity>,
}

impl ReconcileReport {
    /// Capacity lines that are short of processes.
    pub fn shortfalls(&self) -> impl Iterator<Item = &Capacity> {
        self.capacity.iter().filter(|c| c.missing() > 0)
    }
}

/// Worker code of a pool unit slot.
pub fn unit_code(unit: u32) -> String {
    format!("u{unit}")
}

/// Reconciles one node's processes against its layout.
pub struct Maintainer {
    store: Arc<dyn KeyValueStore>,
    registry: ProcessRegistry,
    probe: Arc<dyn ProcessProbe>,
    node: String,
    metrics: MetricsCollector,
}

impl Maintainer {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        node: impl Into<String>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            registry: ProcessRegistry::new(store.clone()),
            store,
            probe,
            node: node.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Publishes the layout's queues, culls dead local processes and
    /// computes capacity.
    pub async fn reconcile(&self, layout: &PoolLayout) -> Result<ReconcileReport, MaintainerError> {
        let mut report = ReconcileReport {
            deregistered_queues: self.sync_queues(layout).await?,
            ..Default::default()
        };

        let mut workers = Vec::new();
        for image in self.registry.list::<WorkerImage>().await? {
            if image.node() != self.node {
                continue;
            }
            if self.probe.is_alive(image.pid()).await {
                workers.push(image);
                continue;
            }
            report.recovered += recover_buffer(self.store.clone(), &image).await?;
            self.registry.unregister_worker(&image).await?;
            warn!(worker = %image, "Culled dead worker");
            report.culled.push(image.to_string());
        }
        let allocators = self.cull::<AllocatorImage>(&mut report.culled).await?;
        let schedulers = self.cull::<SchedulerImage>(&mut report.culled).await?;

        let mut running: HashMap<(ProcessKind, String, Option<String>), u32> = HashMap::new();
        for image in &workers {
            let code = layout
                .pool(image.pool())
                .map(|_| image.code().to_string());
            *running
                .entry((ProcessKind::Worker, image.pool().to_string(), code))
                .or_default() += 1;
        }
        for image in &allocators {
            *running
                .entry((ProcessKind::Allocator, image.pool().to_string(), None))
                .or_default() += 1;
        }
        *running
            .entry((ProcessKind::Scheduler, String::new(), None))
            .or_default() += schedulers.len() as u32;

        let mut desired: Vec<(ProcessKind, String, Option<String>, u32)> = Vec::new();
        for queue in &layout.queues {
            desired.push((ProcessKind::Worker, queue.name.clone(), None, queue.workers));
        }
        for pool in &layout.pools {
            desired.push((ProcessKind::Allocator, pool.name.clone(), None, 1));
            for unit in 0..pool.units {
                desired.push((
                    ProcessKind::Worker,
                    pool.name.clone(),
                    Some(unit_code(unit)),
                    pool.workers_per_unit,
                ));
            }
        }
        desired.push((ProcessKind::Scheduler, String::new(), None, 1));

        let mut covered = BTreeSet::new();
        for (kind, pool, code, want) in desired {
            let key = (kind, pool, code);
            let have = running.get(&key).copied().unwrap_or(0);
            covered.insert(key.clone());
            let (kind, pool, code) = key;
            report.capacity.push(Capacity {
                kind,
                pool,
                code,
                running: have,
                desired: want,
            });
        }
        // Processes running for slots the layout no longer declares.
        let mut stray: Vec<_> = running
            .into_iter()
            .filter(|(key, count)| *count > 0 && !covered.contains(key))
            .collect();
        stray.sort();
        for ((kind, pool, code), have) in stray {
            report.capacity.push(Capacity {
                kind,
                pool,
                code,
                running: have,
                desired: 0,
            });
        }

        for queue in &layout.queues {
            let depth = self.store.llen(&keys::queue(&queue.name)).await?;
            self.metrics.set_queue_depth(&queue.name, depth);
        }

        for line in report.shortfalls() {
            info!(
                kind = ?line.kind,
                pool = %line.pool,
                code = ?line.code,
                running = line.running,
                desired = line.desired,
                "Capacity short"
            );
        }
        Ok(report)
    }

    /// Makes the queue registry match the layout. Returns the removed names.
    async fn sync_queues(&self, layout: &PoolLayout) -> Result<Vec<String>, MaintainerError> {
        for queue in &layout.queues {
            self.store.sadd(keys::QUEUE_REGISTRY, &queue.name).await?;
        }
        let mut removed = Vec::new();
        for name in self.store.smembers(keys::QUEUE_REGISTRY).await? {
            if layout.queue(&name).is_none() {
                self.store.srem(keys::QUEUE_REGISTRY, &name).await?;
                info!(queue = %name, "Queue deregistered");
                removed.push(name);
            }
        }
        removed.sort();
        Ok(removed)
    }

    /// Removes dead local processes of kind `I` and returns the live ones.
    async fn cull<I: ProcessIdentity>(
        &self,
        culled: &mut Vec<String>,
    ) -> Result<Vec<I>, MaintainerError> {
        let mut alive = Vec::new();
        for image in self.registry.list::<I>().await? {
            if image.node() != self.node {
                continue;
            }
            if self.probe.is_alive(image.pid()).await {
                alive.push(image);
            } else {
                self.registry.unregister(&image).await?;
                warn!(registry = I::REGISTRY, process = %image, "Culled dead process");
                culled.push(image.to_string());
            }
        }
        Ok(alive)
    }
}
