//! Time-based job release.
//!
//! - [`DelayedScheduler`]: one-shot jobs released at a timestamp
//! - [`PlannedScheduler`]: recurring plans re-armed after every firing
//! - [`SchedulerLoop`]: drives both on a fixed tick
//!
//! Both keep a sorted set of timestamps (member and score are the same
//! unix second) pointing at per-timestamp bucket lists. A drain pass asks
//! for the smallest timestamp `<= now`, empties its bucket through the
//! producer front door and removes the timestamp once the bucket is empty.

mod delayed;
mod planned;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, StoreError};
use crate::store::{unexpected_reply, AtomicScript, KeyValueStore};
use crate::worker::shutdown_requested;

pub use self::delayed::DelayedScheduler;
pub use self::planned::PlannedScheduler;

/// Default pause between drain passes.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Smallest timestamp of `schedule` that is due at `now`.
///
/// Members that are not integer timestamps are removed.
async fn next_due(
    store: &dyn KeyValueStore,
    schedule: &str,
    now: i64,
) -> Result<Option<i64>, StoreError> {
    loop {
        let due = store
            .zrangebyscore(schedule, f64::NEG_INFINITY, now as f64, Some(1))
            .await?;
        let Some(member) = due.into_iter().next() else {
            return Ok(None);
        };
        match member.parse::<i64>() {
            Ok(ts) => return Ok(Some(ts)),
            Err(_) => {
                warn!(schedule = %schedule, member = %member, "Removing invalid schedule entry");
                store.zrem(schedule, &member).await?;
            }
        }
    }
}

/// Drops an empty bucket and its timestamp. Returns whether it did.
async fn cleanup_bucket(
    store: &dyn KeyValueStore,
    bucket: &str,
    schedule: &str,
    ts: i64,
) -> Result<bool, StoreError> {
    let script = AtomicScript::BucketCleanup;
    let reply = store
        .eval(
            script,
            &[bucket.to_string(), schedule.to_string()],
            &[ts.to_string()],
        )
        .await?;
    match reply.first().map(String::as_str) {
        Some("cleaned") => Ok(true),
        Some("pending") => Ok(false),
        _ => Err(unexpected_reply(script, &reply)),
    }
}

/// Runs delayed and planned drain passes every tick until shutdown.
pub struct SchedulerLoop {
    delayed: DelayedScheduler,
    planned: PlannedScheduler,
    tick: Duration,
}

impl SchedulerLoop {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            delayed: DelayedScheduler::new(store.clone()),
            planned: PlannedScheduler::new(store),
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// One delayed pass followed by one planned pass. Returns the number of
    /// jobs released.
    pub async fn tick_once(&self, now: i64) -> Result<usize, SchedulerError> {
        let mut released = 0;

        match self.delayed.execute(now).await {
            Ok(count) => released += count,
            Err(e) if e.is_invariant_violation() => return Err(e),
            Err(e) => error!(kind = "delayed", error = %e, "Scheduler pass failed"),
        }
        match self.planned.execute(now).await {
            Ok(count) => released += count,
            Err(e) if e.is_invariant_violation() => return Err(e),
            Err(e) => error!(kind = "planned", error = %e, "Scheduler pass failed"),
        }

        Ok(released)
    }

    /// Loops until shutdown or an invariant violation.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SchedulerError> {
        info!(tick_ms = self.tick.as_millis() as u64, "Scheduler started");

        while !shutdown_requested(&mut shutdown) {
            let now = chrono::Utc::now().timestamp();
            let released = self.tick_once(now).await?;
            if released > 0 {
                debug!(released = released, "Scheduler released jobs");
            }
            tokio::time::sleep(self.tick).await;
        }

        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Destination, Job, PlannedJob, RecurrenceInterval};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_next_due_skips_invalid_members() {
        let store = MemoryStore::new();
        store.zadd("sched", "bogus", 5.0).await.unwrap();
        store.zadd("sched", "10", 10.0).await.unwrap();
        store.zadd("sched", "50", 50.0).await.unwrap();

        assert_eq!(next_due(&store, "sched", 20).await.unwrap(), Some(10));
        assert!(store.zscore("sched", "bogus").await.unwrap().is_none());
        assert_eq!(next_due(&store, "sched", 9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_non_empty_bucket() {
        let store = MemoryStore::new();
        store.lpush("bucket", "x").await.unwrap();
        store.zadd("sched", "10", 10.0).await.unwrap();
        assert!(!cleanup_bucket(&store, "bucket", "sched", 10).await.unwrap());

        store.rpop("bucket").await.unwrap();
        assert!(cleanup_bucket(&store, "bucket", "sched", 10).await.unwrap());
        assert!(store.zscore("sched", "10").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tick_runs_both_schedulers() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = SchedulerLoop::new(store.clone());

        scheduler
            .delayed
            .schedule(100, &Destination::queue("default"), Job::new("Once"))
            .await
            .unwrap();
        let interval: RecurrenceInterval = "PT60S".parse().unwrap();
        scheduler
            .planned
            .schedule(&PlannedJob::new(Job::new("Every"), 100, &interval))
            .await
            .unwrap();

        assert_eq!(scheduler.tick_once(100).await.unwrap(), 2);
        assert_eq!(store.llen("queue:default").await.unwrap(), 2);
        assert_eq!(scheduler.tick_once(100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = SchedulerLoop::new(store).with_tick(Duration::from_millis(5));
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), scheduler.run(rx))
            .await
            .unwrap()
            .unwrap();
    }
}
