//! Batch pools.
//!
//! A batch pool groups jobs into batches keyed by `sourceId:jobName:suffix`
//! and spreads batches over a fixed number of units. Each unit owns a list
//! of batch ids (`pool:<p>:<unit>:queues`); the pool's sorted set
//! `pool:<p>:unit_queues` scores every unit-queue key by its length.
//!
//! Invariants kept by the scripts in this module:
//!
//! - at most one batch per `(pool, sourceId)` sits in a unit queue; later
//!   batches wait in `pool:<p>:backlog:<sourceId>`
//! - every unit-queue score equals the length of its list
//!
//! Batches flow `incoming`/`committed` -> unit queue -> removed, with
//! [`BatchAllocator`] driving the first hop and batch-pool workers the last.

mod allocator;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::PoolError;
use crate::job::Job;
use crate::store::{keys, unexpected_reply, AtomicScript, KeyValueStore};

pub use self::allocator::{AllocationResult, BatchAllocator};

/// Identity of one batch inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchImage {
    source_id: String,
    job_name: String,
    suffix: String,
}

impl BatchImage {
    pub fn new(
        source_id: impl Into<String>,
        job_name: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Result<Self, PoolError> {
        let image = Self {
            source_id: source_id.into(),
            job_name: job_name.into(),
            suffix: suffix.into(),
        };
        let bad = |s: &str| s.is_empty() || s.contains(':');
        if bad(&image.source_id) || bad(&image.job_name) || image.suffix.contains(':') {
            return Err(PoolError::InvalidBatch(image.id()));
        }
        Ok(image)
    }

    /// Batch a job belongs to when enqueued with `suffix`.
    pub fn for_job(job: &Job, suffix: &str) -> Result<Self, PoolError> {
        let source_id = job
            .source_id
            .as_deref()
            .ok_or_else(|| PoolError::InvalidBatch(format!("{}:<no source>", job.class)))?;
        Self::new(source_id, job.display_name(), suffix)
    }

    /// Store-facing id: `sourceId:jobName:suffix`.
    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.source_id, self.job_name, self.suffix)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl fmt::Display for BatchImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl FromStr for BatchImage {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(source), Some(name), Some(suffix)) => Self::new(source, name, suffix),
            _ => Err(PoolError::InvalidBatch(s.to_string())),
        }
    }
}

/// Least-loaded unit resolved before an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTarget {
    pub unit: u32,
    pub key: String,
}

/// Result of [`BatchPoolAssigner::assign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    /// The batch went into the target unit queue.
    Assigned,
    /// Another batch of the same source is in flight; this one waits.
    Backlogged,
}

impl AssignOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignOutcome::Assigned => "assigned",
            AssignOutcome::Backlogged => "backlogged",
        }
    }
}

/// Result of [`BatchPoolAssigner::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The batch still holds jobs and was left in place.
    Pending,
    /// The batch id was not in the unit queue.
    Absent,
    /// The batch left its unit; `released` is the backlog entry moved to
    /// `committed`, if any.
    Removed { released: Option<String> },
}

/// Result of [`BatchPoolAssigner::migrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    Migrated,
    Absent,
}

/// Atomic batch operations for one pool.
#[derive(Clone)]
pub struct BatchPoolAssigner {
    store: Arc<dyn KeyValueStore>,
    pool: String,
}

impl BatchPoolAssigner {
    pub fn new(store: Arc<dyn KeyValueStore>, pool: impl Into<String>) -> Self {
        Self {
            store,
            pool: pool.into(),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn unit_key(&self, unit: u32) -> String {
        keys::unit_queue(&self.pool, unit)
    }

    /// Picks the unit with the lowest score; ties go to the
    /// lexicographically smallest key.
    pub async fn resolve_target(&self) -> Result<UnitTarget, PoolError> {
        let lowest = self
            .store
            .zrange_with_scores(&keys::unit_queues(&self.pool), 0, 0)
            .await?;
        let (key, _) = lowest
            .into_iter()
            .next()
            .ok_or_else(|| PoolError::NoUnits(self.pool.clone()))?;
        let unit = keys::parse_unit_queue(&self.pool, &key)
            .ok_or_else(|| PoolError::StaleTarget(key.clone()))?;
        Ok(UnitTarget { unit, key })
    }

    /// Places `batch` into `target`, or into its source backlog if another
    /// batch of the same source is in flight.
    ///
    /// Returns `PoolError::StaleTarget` if `target` left the pool after it
    /// was resolved.
    pub async fn assign(
        &self,
        batch: &BatchImage,
        target: &UnitTarget,
    ) -> Result<AssignOutcome, PoolError> {
        let script = AtomicScript::BatchAssign;
        let reply = self
            .store
            .eval(
                script,
                &[
                    keys::pool_sources(&self.pool),
                    keys::pool_backlog(&self.pool, batch.source_id()),
                    target.key.clone(),
                    keys::unit_queues(&self.pool),
                ],
                &[
                    batch.source_id().to_string(),
                    batch.id(),
                    target.unit.to_string(),
                ],
            )
            .await?;

        match reply.first().map(String::as_str) {
            Some("assigned") => {
                debug!(pool = %self.pool, batch = %batch, unit = target.unit, "Batch assigned");
                Ok(AssignOutcome::Assigned)
            }
            Some("backlogged") => {
                debug!(pool = %self.pool, batch = %batch, "Batch backlogged behind in-flight source");
                Ok(AssignOutcome::Backlogged)
            }
            Some("stale") => Err(PoolError::StaleTarget(target.key.clone())),
            _ => Err(unexpected_reply(script, &reply).into()),
        }
    }

    /// Resolves the least-loaded unit and assigns `batch` to it.
    pub async fn assign_to_least_loaded(
        &self,
        batch: &BatchImage,
    ) -> Result<AssignOutcome, PoolError> {
        let target = self.resolve_target().await?;
        self.assign(batch, &target).await
    }

    /// Removes an exhausted batch from `unit`, frees its source and moves
    /// the next backlog entry of that source to `committed`.
    pub async fn remove(&self, batch: &BatchImage, unit: u32) -> Result<RemoveOutcome, PoolError> {
        let script = AtomicScript::BatchRemove;
        let batch_id = batch.id();
        let reply = self
            .store
            .eval(
                script,
                &[
                    self.unit_key(unit),
                    keys::unit_queues(&self.pool),
                    keys::pool_sources(&self.pool),
                    keys::pool_backlog(&self.pool, batch.source_id()),
                    keys::pool_committed(&self.pool),
                    keys::pool_batch(&self.pool, &batch_id),
                    keys::pool_batches(&self.pool),
                ],
                &[batch_id.clone(), batch.source_id().to_string()],
            )
            .await?;

        match reply.as_slice() {
            [status] if status == "pending" => Ok(RemoveOutcome::Pending),
            [status] if status == "absent" => Ok(RemoveOutcome::Absent),
            [status] if status == "removed" => {
                debug!(pool = %self.pool, batch = %batch_id, unit, "Batch removed");
                Ok(RemoveOutcome::Removed { released: None })
            }
            [status, next] if status == "removed" => {
                info!(
                    pool = %self.pool,
                    batch = %batch_id,
                    released = %next,
                    "Batch removed, released backlog entry"
                );
                Ok(RemoveOutcome::Removed {
                    released: Some(next.clone()),
                })
            }
            _ => Err(unexpected_reply(script, &reply).into()),
        }
    }

    /// Moves `batch_id` from unit `from` to the unit `to`.
    pub async fn migrate(
        &self,
        batch: &BatchImage,
        from: u32,
        to: &UnitTarget,
    ) -> Result<MigrateOutcome, PoolError> {
        let script = AtomicScript::BatchMigrate;
        let reply = self
            .store
            .eval(
                script,
                &[
                    self.unit_key(from),
                    to.key.clone(),
                    keys::unit_queues(&self.pool),
                    keys::pool_sources(&self.pool),
                ],
                &[
                    batch.id(),
                    batch.source_id().to_string(),
                    to.unit.to_string(),
                ],
            )
            .await?;

        match reply.first().map(String::as_str) {
            Some("migrated") => Ok(MigrateOutcome::Migrated),
            Some("absent") => Ok(MigrateOutcome::Absent),
            Some("stale") => Err(PoolError::StaleTarget(to.key.clone())),
            _ => Err(unexpected_reply(script, &reply).into()),
        }
    }

    /// Live units with their recorded scores, in rank order.
    pub async fn units(&self) -> Result<Vec<(u32, u64)>, PoolError> {
        let entries = self
            .store
            .zrange_with_scores(&keys::unit_queues(&self.pool), 0, -1)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, score)| {
                keys::parse_unit_queue(&self.pool, &key).map(|unit| (unit, score as u64))
            })
            .collect())
    }

    /// Whether `unit` is still part of the pool.
    pub async fn is_live(&self, unit: u32) -> Result<bool, PoolError> {
        Ok(self
            .store
            .zscore(&keys::unit_queues(&self.pool), &self.unit_key(unit))
            .await?
            .is_some())
    }

    /// Adds `unit` to the pool, scored by its current length.
    pub async fn ensure_unit(&self, unit: u32) -> Result<(), PoolError> {
        let key = self.unit_key(unit);
        let len = self.store.llen(&key).await?;
        self.store
            .zadd(&keys::unit_queues(&self.pool), &key, len as f64)
            .await?;
        Ok(())
    }

    /// Takes `unit` out of the pool's sorted set. Its list is left alone.
    pub async fn retire_unit(&self, unit: u32) -> Result<bool, PoolError> {
        Ok(self
            .store
            .zrem(&keys::unit_queues(&self.pool), &self.unit_key(unit))
            .await?)
    }

    /// Batch ids queued on `unit`, oldest last.
    pub async fn batch_ids(&self, unit: u32) -> Result<Vec<String>, PoolError> {
        Ok(self.store.lrange(&self.unit_key(unit), 0, -1).await?)
    }
}
