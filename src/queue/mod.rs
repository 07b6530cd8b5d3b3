//! Enqueue front door and job sources.
//!
//! - [`Producer`]: pushes jobs to FIFO queues or batch pools, honoring
//!   uniqueness through staging + [`UniqueCoordinator::try_acquire`]
//! - [`JobSource`]: where a worker gets its next job from; implemented by
//!   [`FifoSource`], [`BufferedSource`] and [`BatchPoolSource`]

mod source;

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::{EnqueueError, PoolError};
use crate::job::{Destination, Job, QueuedJob};
use crate::pool::BatchImage;
use crate::store::{keys, unexpected_reply, AtomicScript, KeyValueStore};
use crate::unique::{AcquireOutcome, UniqueCoordinator};

pub use self::source::{BatchPoolSource, BufferedSource, FifoSource, JobSource, Reservation};

/// Store key of the list a destination's jobs are pushed to, plus the
/// batch when the destination is a pool.
fn destination_key(
    dest: &Destination,
    job: &Job,
) -> Result<(String, Option<BatchImage>), EnqueueError> {
    match dest {
        Destination::Queue { name } => Ok((keys::queue(name), None)),
        Destination::Pool { pool, suffix } => {
            let batch = BatchImage::for_job(job, suffix)?;
            Ok((keys::pool_batch(pool, &batch.id()), Some(batch)))
        }
    }
}

/// Fails when `job` can never be enqueued to `dest`, such as a pool job
/// without a source id.
pub fn check_destination(dest: &Destination, job: &Job) -> Result<(), EnqueueError> {
    destination_key(dest, job).map(|_| ())
}

/// Producer-side enqueue path.
///
/// A job either lands in its destination and its id is returned, or the
/// call fails with nothing enqueued.
pub struct Producer {
    store: Arc<dyn KeyValueStore>,
    unique: UniqueCoordinator,
}

impl Producer {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            unique: UniqueCoordinator::new(store.clone()),
            store,
        }
    }

    /// Enqueues `job` and returns its queued id.
    ///
    /// # Errors
    ///
    /// - `EnqueueError::UniqueConflict` if a non-deferrable job's unique id
    ///   is already queued or running
    /// - `EnqueueError::InvariantViolation` if the payload moved by the
    ///   store differs from the staged one
    pub async fn enqueue(&self, dest: &Destination, job: Job) -> Result<String, EnqueueError> {
        let (dest_key, batch) = destination_key(dest, &job)?;
        let queued = QueuedJob::new(job);
        let payload = queued.encode()?;

        let Some(uid) = queued.job.unique_id() else {
            match (dest, &batch) {
                (Destination::Pool { pool, .. }, Some(batch)) => {
                    self.append_to_batch(pool, batch, &payload).await?;
                }
                _ => {
                    self.store.lpush(&dest_key, &payload).await?;
                }
            }
            debug!(job_id = %queued.id, destination = %dest, "Job enqueued");
            return Ok(queued.id);
        };

        let staging = keys::staging(&queued.id);
        self.store.lpush(&staging, &payload).await?;

        let moved = match self.unique.try_acquire(uid, &staging, &dest_key).await {
            Ok(AcquireOutcome::Acquired(moved)) => moved,
            Ok(AcquireOutcome::Exists) if queued.job.is_deferrable() => {
                // Let the worker-side lock coalesce this copy.
                match self.store.rpoplpush(&staging, &dest_key).await? {
                    Some(moved) => moved,
                    None => return Err(self.violation(&queued.id, "staged payload vanished")),
                }
            }
            Ok(AcquireOutcome::Exists) => {
                self.store.del(&staging).await?;
                info!(unique_id = %uid, destination = %dest, "Unique job already queued or running");
                return Err(EnqueueError::UniqueConflict(uid.to_string()));
            }
            Ok(AcquireOutcome::Empty) => {
                return Err(self.violation(&queued.id, "staged payload vanished"));
            }
            Err(crate::error::UniqueError::Store(e)) => return Err(e.into()),
            Err(e) => return Err(self.violation(&queued.id, &e.to_string())),
        };

        if moved != payload {
            return Err(self.violation(&queued.id, "moved payload differs from staged payload"));
        }

        if let (Destination::Pool { pool, .. }, Some(batch)) = (dest, &batch) {
            self.register_batch(pool, batch).await?;
        }

        debug!(job_id = %queued.id, unique_id = %uid, destination = %dest, "Unique job enqueued");
        Ok(queued.id)
    }

    /// Puts a reserved `payload` back at the consuming end of `dest`,
    /// leaving unique state alone. The payload keeps its id.
    pub async fn restore(
        &self,
        dest: &Destination,
        job: &Job,
        payload: &str,
    ) -> Result<(), EnqueueError> {
        let (dest_key, batch) = destination_key(dest, job)?;
        match (dest, &batch) {
            (Destination::Pool { pool, .. }, Some(batch)) => {
                self.append_to_batch(pool, batch, payload).await
            }
            _ => {
                self.store.rpush(&dest_key, payload).await?;
                Ok(())
            }
        }
    }

    fn violation(&self, job_id: &str, detail: &str) -> EnqueueError {
        error!(critical = true, job_id = %job_id, detail = %detail, "Enqueue invariant violated");
        EnqueueError::InvariantViolation(format!("job {job_id}: {detail}"))
    }

    async fn append_to_batch(
        &self,
        pool: &str,
        batch: &BatchImage,
        payload: &str,
    ) -> Result<(), EnqueueError> {
        let script = AtomicScript::BatchAppend;
        let batch_id = batch.id();
        let reply = self
            .store
            .eval(
                script,
                &[
                    keys::pool_batch(pool, &batch_id),
                    keys::pool_batches(pool),
                    keys::pool_incoming(pool),
                ],
                &[payload.to_string(), batch_id],
            )
            .await?;
        match reply.first().map(String::as_str) {
            Some("appended") | Some("registered") => Ok(()),
            _ => Err(PoolError::from(unexpected_reply(script, &reply)).into()),
        }
    }

    async fn register_batch(&self, pool: &str, batch: &BatchImage) -> Result<(), EnqueueError> {
        let script = AtomicScript::BatchRegister;
        let reply = self
            .store
            .eval(
                script,
                &[keys::pool_batches(pool), keys::pool_incoming(pool)],
                &[batch.id()],
            )
            .await?;
        match reply.first().map(String::as_str) {
            Some("registered") | Some("known") => Ok(()),
            _ => Err(PoolError::from(unexpected_reply(script, &reply)).into()),
        }
    }
}
