//! Allocator loop moving new batches into unit queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{AssignOutcome, BatchImage, BatchPoolAssigner};
use crate::error::PoolError;
use crate::metrics::MetricsCollector;
use crate::store::{keys, KeyValueStore};
use crate::worker::shutdown_requested;

/// What one allocation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationResult {
    /// Nothing was waiting.
    Idle,
    Assigned { batch: String, unit: u32 },
    Backlogged { batch: String },
    /// The popped entry was not a valid batch id and was dropped.
    Dropped { raw: String },
}

/// Drains a pool's `committed` and `incoming` lists into its units.
pub struct BatchAllocator {
    store: Arc<dyn KeyValueStore>,
    assigner: BatchPoolAssigner,
    metrics: MetricsCollector,
}

impl BatchAllocator {
    pub fn new(store: Arc<dyn KeyValueStore>, pool: impl Into<String>) -> Self {
        Self {
            assigner: BatchPoolAssigner::new(store.clone(), pool),
            store,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn assigner(&self) -> &BatchPoolAssigner {
        &self.assigner
    }

    /// Assigns at most one batch.
    ///
    /// The target unit is resolved before anything is popped, so
    /// `PoolError::NoUnits` never consumes a batch. Released backlog entries
    /// in `committed` go before fresh batches in `incoming`. A target retired
    /// in between puts the batch back where it came from.
    pub async fn allocate_once(&self) -> Result<AllocationResult, PoolError> {
        let pool = self.assigner.pool().to_string();
        let target = self.assigner.resolve_target().await?;

        let committed = keys::pool_committed(&pool);
        let incoming = keys::pool_incoming(&pool);
        let (origin, batch_id) = match self.store.rpop(&committed).await? {
            Some(id) => (committed, id),
            None => match self.store.rpop(&incoming).await? {
                Some(id) => (incoming, id),
                None => return Ok(AllocationResult::Idle),
            },
        };

        let batch: BatchImage = match batch_id.parse() {
            Ok(batch) => batch,
            Err(e) => {
                error!(pool = %pool, raw = %batch_id, error = %e, "Dropping invalid batch id");
                return Ok(AllocationResult::Dropped { raw: batch_id });
            }
        };

        match self.assigner.assign(&batch, &target).await {
            Ok(AssignOutcome::Assigned) => {
                self.metrics.record_batch(&pool, "assigned");
                Ok(AllocationResult::Assigned {
                    batch: batch_id,
                    unit: target.unit,
                })
            }
            Ok(AssignOutcome::Backlogged) => {
                self.metrics.record_batch(&pool, "backlogged");
                Ok(AllocationResult::Backlogged { batch: batch_id })
            }
            Err(PoolError::StaleTarget(key)) => {
                self.metrics.record_batch(&pool, "stale");
                self.store.rpush(&origin, &batch_id).await?;
                Err(PoolError::StaleTarget(key))
            }
            Err(e) => Err(e),
        }
    }

    /// Runs allocation passes until shutdown, sleeping `poll` when idle or
    /// after an error.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>, poll: Duration) {
        let pool = self.assigner.pool().to_string();
        info!(pool = %pool, "Allocator started");

        while !shutdown_requested(&mut shutdown) {
            match self.allocate_once().await {
                Ok(AllocationResult::Idle) => {
                    debug!(pool = %pool, "No batches waiting");
                    tokio::time::sleep(poll).await;
                }
                Ok(result) => debug!(pool = %pool, result = ?result, "Allocation pass"),
                Err(PoolError::StaleTarget(key)) => {
                    debug!(pool = %pool, unit_queue = %key, "Target retired, retrying");
                }
                Err(PoolError::NoUnits(_)) => {
                    warn!(pool = %pool, "Pool has no units, waiting for rebalance");
                    tokio::time::sleep(poll).await;
                }
                Err(e) => {
                    error!(pool = %pool, error = %e, "Allocation failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }

        info!(pool = %pool, "Allocator stopped");
    }
}
