//! Job sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::error::{PoolError, SourceError};
use crate::job::{Destination, QueuedJob};
use crate::pool::{BatchImage, BatchPoolAssigner, RemoveOutcome};
use crate::store::{keys, KeyValueStore};

/// Poll step of sources that cannot block on a single list.
const BATCH_POLL_STEP: Duration = Duration::from_millis(250);

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub job: QueuedJob,
    /// Payload exactly as stored.
    pub payload: String,
    /// Where retries of this job go.
    pub origin: Destination,
    /// Buffer list holding `payload` until acknowledged.
    pub buffer: Option<String>,
}

/// Where a worker gets its next job from.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Kind label used in metrics.
    fn kind(&self) -> &'static str;

    /// Waits up to `timeout` for a job.
    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<Reservation>, SourceError>;

    async fn pop_non_blocking(&self) -> Result<Option<Reservation>, SourceError>;

    /// Confirms processing of `reservation` finished.
    async fn ack(&self, reservation: &Reservation) -> Result<(), SourceError>;
}

/// Decodes a popped payload. Corrupt payloads are logged with their raw
/// content and removed from `buffer` (if any); `None` is returned for them.
async fn decode_or_drop(
    store: &dyn KeyValueStore,
    source: &str,
    payload: String,
    origin: &Destination,
    buffer: Option<&str>,
) -> Result<Option<Reservation>, SourceError> {
    match QueuedJob::decode(&payload) {
        Ok(job) => Ok(Some(Reservation {
            job,
            payload,
            origin: origin.clone(),
            buffer: buffer.map(str::to_string),
        })),
        Err(e) => {
            error!(source = %source, raw = %e.raw(), error = %e, "Dropping corrupt job payload");
            if let Some(buffer) = buffer {
                store.lrem(buffer, -1, &payload).await?;
            }
            Ok(None)
        }
    }
}

/// Raises `Unavailable` once `queue` has left the queue registry.
async fn ensure_registered(store: &dyn KeyValueStore, queue: &str) -> Result<(), SourceError> {
    if store.sismember(keys::QUEUE_REGISTRY, queue).await? {
        Ok(())
    } else {
        Err(SourceError::Unavailable(queue.to_string()))
    }
}

/// Plain FIFO queue source. A crash mid-job loses the job.
pub struct FifoSource {
    store: Arc<dyn KeyValueStore>,
    queue: String,
    key: String,
    origin: Destination,
}

impl FifoSource {
    pub fn new(store: Arc<dyn KeyValueStore>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            store,
            key: keys::queue(&queue),
            origin: Destination::queue(queue.clone()),
            queue,
        }
    }

    async fn finish(&self, payload: Option<String>) -> Result<Option<Reservation>, SourceError> {
        match payload {
            Some(payload) => {
                decode_or_drop(self.store.as_ref(), &self.queue, payload, &self.origin, None).await
            }
            None => {
                ensure_registered(self.store.as_ref(), &self.queue).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobSource for FifoSource {
    fn name(&self) -> &str {
        &self.queue
    }

    fn kind(&self) -> &'static str {
        "fifo"
    }

    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<Reservation>, SourceError> {
        let payload = self.store.brpop(&self.key, timeout).await?;
        self.finish(payload).await
    }

    async fn pop_non_blocking(&self) -> Result<Option<Reservation>, SourceError> {
        let payload = self.store.rpop(&self.key).await?;
        self.finish(payload).await
    }

    async fn ack(&self, _reservation: &Reservation) -> Result<(), SourceError> {
        Ok(())
    }
}

/// FIFO queue source that parks each popped payload in a worker buffer
/// until it is acknowledged.
pub struct BufferedSource {
    store: Arc<dyn KeyValueStore>,
    queue: String,
    key: String,
    buffer: String,
    origin: Destination,
}

impl BufferedSource {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queue: impl Into<String>,
        buffer: impl Into<String>,
    ) -> Self {
        let queue = queue.into();
        Self {
            store,
            key: keys::queue(&queue),
            buffer: buffer.into(),
            origin: Destination::queue(queue.clone()),
            queue,
        }
    }

    async fn finish(&self, payload: Option<String>) -> Result<Option<Reservation>, SourceError> {
        match payload {
            Some(payload) => {
                decode_or_drop(
                    self.store.as_ref(),
                    &self.queue,
                    payload,
                    &self.origin,
                    Some(&self.buffer),
                )
                .await
            }
            None => {
                ensure_registered(self.store.as_ref(), &self.queue).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobSource for BufferedSource {
    fn name(&self) -> &str {
        &self.queue
    }

    fn kind(&self) -> &'static str {
        "buffered"
    }

    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<Reservation>, SourceError> {
        let payload = self
            .store
            .brpoplpush(&self.key, &self.buffer, timeout)
            .await?;
        self.finish(payload).await
    }

    async fn pop_non_blocking(&self) -> Result<Option<Reservation>, SourceError> {
        let payload = self.store.rpoplpush(&self.key, &self.buffer).await?;
        self.finish(payload).await
    }

    async fn ack(&self, reservation: &Reservation) -> Result<(), SourceError> {
        self.store
            .lrem(&self.buffer, -1, &reservation.payload)
            .await?;
        Ok(())
    }
}

/// Source over one unit of a batch pool.
///
/// Round-robins across the unit's batches, moving one job at a time into
/// the worker buffer. Exhausted batches are removed from the unit, which
/// releases the next backlog entry of their source.
pub struct BatchPoolSource {
    store: Arc<dyn KeyValueStore>,
    assigner: BatchPoolAssigner,
    unit: u32,
    buffer: String,
    name: String,
    cursor: AtomicUsize,
}

impl BatchPoolSource {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        pool: impl Into<String>,
        unit: u32,
        buffer: impl Into<String>,
    ) -> Self {
        let assigner = BatchPoolAssigner::new(store.clone(), pool);
        let name = format!("{}/{}", assigner.pool(), unit);
        Self {
            store,
            assigner,
            unit,
            buffer: buffer.into(),
            name,
            cursor: AtomicUsize::new(0),
        }
    }

    async fn release(&self, batch: &BatchImage) -> Result<(), PoolError> {
        match self.assigner.remove(batch, self.unit).await? {
            RemoveOutcome::Removed { released } => {
                debug!(unit = %self.name, batch = %batch, released = ?released, "Batch exhausted");
            }
            RemoveOutcome::Pending => {
                debug!(unit = %self.name, batch = %batch, "Batch received new jobs, keeping it");
            }
            RemoveOutcome::Absent => {}
        }
        Ok(())
    }
}

#[async_trait]
impl JobSource for BatchPoolSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "batch"
    }

    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<Reservation>, SourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reservation) = self.pop_non_blocking().await? {
                return Ok(Some(reservation));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(BATCH_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn pop_non_blocking(&self) -> Result<Option<Reservation>, SourceError> {
        if !self.assigner.is_live(self.unit).await? {
            return Err(SourceError::Unavailable(self.name.clone()));
        }

        let mut batch_ids = self.assigner.batch_ids(self.unit).await?;
        if batch_ids.is_empty() {
            return Ok(None);
        }
        // Oldest batch first.
        batch_ids.reverse();

        let start = self.cursor.load(Ordering::Relaxed) % batch_ids.len();
        for offset in 0..batch_ids.len() {
            let index = (start + offset) % batch_ids.len();
            let batch_id = &batch_ids[index];
            let batch: BatchImage = match batch_id.parse() {
                Ok(batch) => batch,
                Err(e) => {
                    error!(unit = %self.name, raw = %batch_id, error = %e, "Dropping invalid batch id");
                    self.store
                        .lrem(&self.assigner.unit_key(self.unit), 1, batch_id)
                        .await?;
                    continue;
                }
            };

            let list = keys::pool_batch(self.assigner.pool(), batch_id);
            match self.store.rpoplpush(&list, &self.buffer).await? {
                Some(payload) => {
                    self.cursor.store(index + 1, Ordering::Relaxed);
                    let origin = Destination::pool(self.assigner.pool(), batch.suffix());
                    if let Some(reservation) = decode_or_drop(
                        self.store.as_ref(),
                        &self.name,
                        payload,
                        &origin,
                        Some(&self.buffer),
                    )
                    .await?
                    {
                        return Ok(Some(reservation));
                    }
                }
                None => self.release(&batch).await?,
            }
        }
        Ok(None)
    }

    async fn ack(&self, reservation: &Reservation) -> Result<(), SourceError> {
        self.store
            .lrem(&self.buffer, -1, &reservation.payload)
            .await?;
        Ok(())
    }
}
