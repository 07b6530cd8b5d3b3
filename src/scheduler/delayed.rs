//! One-shot delayed jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::{cleanup_bucket, next_due};
use crate::error::{EnqueueError, SchedulerError};
use crate::job::{Destination, Job, ScheduledEntry};
use crate::metrics::MetricsCollector;
use crate::queue::{check_destination, Producer};
use crate::store::{keys, unexpected_reply, AtomicScript, KeyValueStore};

/// Releases jobs into their destination once their timestamp has passed.
///
/// Entries are [`ScheduledEntry`] JSON in `delayed:<ts>` lists indexed by
/// the `delayed_queue_schedule` sorted set.
pub struct DelayedScheduler {
    store: Arc<dyn KeyValueStore>,
    producer: Producer,
    metrics: MetricsCollector,
}

impl DelayedScheduler {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            producer: Producer::new(store.clone()),
            store,
            metrics: MetricsCollector::new(),
        }
    }

    /// Stores `job` for release to `target` at unix second `at`.
    ///
    /// A job that could never be enqueued to `target` is rejected here
    /// rather than at release time.
    pub async fn schedule(
        &self,
        at: i64,
        target: &Destination,
        job: Job,
    ) -> Result<(), SchedulerError> {
        check_destination(target, &job)?;
        let entry = ScheduledEntry {
            target: target.clone(),
            job,
        };
        let payload = serde_json::to_string(&entry)?;

        let script = AtomicScript::BucketPush;
        let reply = self
            .store
            .eval(
                script,
                &[
                    keys::delayed_bucket(at),
                    keys::DELAYED_SCHEDULE.to_string(),
                ],
                &[payload, at.to_string()],
            )
            .await?;
        if reply.first().map(String::as_str) != Some("pushed") {
            return Err(unexpected_reply(script, &reply).into());
        }

        debug!(at = at, destination = %target, class = %entry.job.class, "Job delayed");
        Ok(())
    }

    /// Stores `job` for release `delay` from now, rounded up to the second.
    pub async fn schedule_in(
        &self,
        delay: Duration,
        target: &Destination,
        job: Job,
    ) -> Result<i64, SchedulerError> {
        let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
        let at = chrono::Utc::now()
            .timestamp()
            .saturating_add(i64::try_from(secs).unwrap_or(i64::MAX));
        self.schedule(at, target, job).await?;
        Ok(at)
    }

    /// Releases every entry due at `now`. Returns the number enqueued.
    ///
    /// A unique conflict drops the entry, as does any error that would
    /// recur on every attempt. A store failure puts the entry back at the
    /// tail of its bucket and aborts the pass.
    pub async fn execute(&self, now: i64) -> Result<usize, SchedulerError> {
        let mut released = 0;

        while let Some(ts) = next_due(self.store.as_ref(), keys::DELAYED_SCHEDULE, now).await? {
            let bucket = keys::delayed_bucket(ts);

            while let Some(raw) = self.store.rpop(&bucket).await? {
                let entry: ScheduledEntry = match serde_json::from_str(&raw) {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!(bucket = %bucket, raw = %raw, error = %e, "Dropping corrupt delayed entry");
                        continue;
                    }
                };

                match self.producer.enqueue(&entry.target, entry.job).await {
                    Ok(job_id) => {
                        released += 1;
                        self.metrics.record_scheduler_fired("delayed");
                        debug!(job_id = %job_id, due = ts, destination = %entry.target, "Delayed job released");
                    }
                    Err(EnqueueError::UniqueConflict(uid)) => {
                        info!(unique_id = %uid, due = ts, "Delayed job dropped, unique copy already queued");
                    }
                    Err(e @ EnqueueError::InvariantViolation(_)) => return Err(e.into()),
                    Err(e) if e.is_transient() => {
                        self.store.rpush(&bucket, &raw).await?;
                        return Err(e.into());
                    }
                    Err(e) => {
                        error!(
                            bucket = %bucket,
                            raw = %raw,
                            error = %e,
                            "Dropping undeliverable delayed entry"
                        );
                    }
                }
            }

            cleanup_bucket(self.store.as_ref(), &bucket, keys::DELAYED_SCHEDULE, ts).await?;
        }

        Ok(released)
    }
}
