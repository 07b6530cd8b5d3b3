//! Recurring plans.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{cleanup_bucket, next_due};
use crate::error::{EnqueueError, SchedulerError};
use crate::job::PlannedJob;
use crate::metrics::MetricsCollector;
use crate::queue::{check_destination, Producer};
use crate::store::{keys, unexpected_reply, AtomicScript, KeyValueStore};

/// Stores plans at `plan:<id>` and fires them from `plan_schedule:<ts>`
/// buckets of plan ids.
///
/// Firing enqueues the occurrence first and then atomically moves the id
/// to the bucket of its next run, so a crash in between re-fires once
/// rather than losing the recurrence.
pub struct PlannedScheduler {
    store: Arc<dyn KeyValueStore>,
    producer: Producer,
    metrics: MetricsCollector,
}

impl PlannedScheduler {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            producer: Producer::new(store.clone()),
            store,
            metrics: MetricsCollector::new(),
        }
    }

    /// Stores or replaces a plan. Plans whose job could never be enqueued
    /// to their target are rejected.
    pub async fn schedule(&self, plan: &PlannedJob) -> Result<(), SchedulerError> {
        plan.interval()?;
        check_destination(&plan.target, &plan.job)?;

        if let Some(existing) = self.get(&plan.id).await? {
            if existing.next_run != plan.next_run {
                self.remove(&plan.id).await?;
            }
        }

        let script = AtomicScript::PlanStore;
        let reply = self
            .store
            .eval(
                script,
                &[
                    keys::plan(&plan.id),
                    keys::plan_bucket(plan.next_run),
                    keys::PLAN_SCHEDULE.to_string(),
                    keys::PLAN_INDEX.to_string(),
                ],
                &[plan.id.clone(), plan.encode()?, plan.next_run.to_string()],
            )
            .await?;
        if reply.first().map(String::as_str) != Some("stored") {
            return Err(unexpected_reply(script, &reply).into());
        }

        info!(
            plan_id = %plan.id,
            class = %plan.job.class,
            next_run = plan.next_run,
            every = %plan.recurrence_interval,
            "Plan stored"
        );
        Ok(())
    }

    pub async fn get(&self, plan_id: &str) -> Result<Option<PlannedJob>, SchedulerError> {
        match self.store.get(&keys::plan(plan_id)).await? {
            Some(raw) => Ok(Some(PlannedJob::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Deletes a plan and its pending occurrence.
    pub async fn remove(&self, plan_id: &str) -> Result<(), SchedulerError> {
        let plan = self
            .get(plan_id)
            .await?
            .ok_or_else(|| SchedulerError::PlanNotFound(plan_id.to_string()))?;
        self.remove_at(plan_id, plan.next_run).await?;
        info!(plan_id = %plan_id, "Plan removed");
        Ok(())
    }

    async fn remove_at(&self, plan_id: &str, ts: i64) -> Result<(), SchedulerError> {
        let script = AtomicScript::PlanRemove;
        let reply = self
            .store
            .eval(
                script,
                &[
                    keys::plan(plan_id),
                    keys::plan_bucket(ts),
                    keys::PLAN_SCHEDULE.to_string(),
                    keys::PLAN_INDEX.to_string(),
                ],
                &[plan_id.to_string(), ts.to_string()],
            )
            .await?;
        if reply.first().map(String::as_str) != Some("removed") {
            return Err(unexpected_reply(script, &reply).into());
        }
        Ok(())
    }

    /// Every stored plan, soonest first. Unreadable plans are skipped.
    pub async fn list(&self) -> Result<Vec<PlannedJob>, SchedulerError> {
        let mut plans = Vec::new();
        for plan_id in self.store.smembers(keys::PLAN_INDEX).await? {
            match self.get(&plan_id).await {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => warn!(plan_id = %plan_id, "Indexed plan has no body"),
                Err(SchedulerError::Payload(e)) => {
                    error!(plan_id = %plan_id, raw = %e.raw(), error = %e, "Unreadable plan");
                }
                Err(e) => return Err(e),
            }
        }
        plans.sort_by(|a, b| a.next_run.cmp(&b.next_run).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    /// Fires every plan due at `now`. Returns the number of occurrences
    /// enqueued.
    pub async fn execute(&self, now: i64) -> Result<usize, SchedulerError> {
        let mut fired = 0;

        while let Some(ts) = next_due(self.store.as_ref(), keys::PLAN_SCHEDULE, now).await? {
            let bucket = keys::plan_bucket(ts);
            for plan_id in self.store.lrange(&bucket, 0, -1).await? {
                if self.fire(&plan_id, ts, now).await? {
                    fired += 1;
                }
            }
            cleanup_bucket(self.store.as_ref(), &bucket, keys::PLAN_SCHEDULE, ts).await?;
        }

        Ok(fired)
    }

    /// Fires one plan found in the bucket of `ts` and re-arms it.
    async fn fire(&self, plan_id: &str, ts: i64, now: i64) -> Result<bool, SchedulerError> {
        let bucket = keys::plan_bucket(ts);

        let mut plan = match self.get(plan_id).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                warn!(plan_id = %plan_id, due = ts, "Dropping id of deleted plan");
                self.store.lrem(&bucket, 0, plan_id).await?;
                return Ok(false);
            }
            Err(SchedulerError::Payload(e)) => {
                error!(plan_id = %plan_id, raw = %e.raw(), error = %e, "Removing unreadable plan");
                self.remove_at(plan_id, ts).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let due = plan.next_run <= now;
        if due {
            match self.producer.enqueue(&plan.target, plan.job.clone()).await {
                Ok(job_id) => {
                    self.metrics.record_scheduler_fired("planned");
                    debug!(plan_id = %plan_id, job_id = %job_id, due = ts, "Plan fired");
                }
                Err(EnqueueError::UniqueConflict(uid)) => {
                    info!(plan_id = %plan_id, unique_id = %uid, "Plan occurrence skipped, unique copy already queued");
                }
                Err(e @ EnqueueError::InvariantViolation(_)) => return Err(e.into()),
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    error!(
                        plan_id = %plan_id,
                        target = %plan.target,
                        error = %e,
                        "Removing plan that cannot be enqueued"
                    );
                    self.remove_at(plan_id, ts).await?;
                    return Ok(false);
                }
            }
        }

        if let Err(e) = plan.advance_past(now) {
            error!(plan_id = %plan_id, error = %e, "Removing plan with invalid interval");
            self.remove_at(plan_id, ts).await?;
            return Ok(due);
        }

        let script = AtomicScript::PlanReschedule;
        let reply = self
            .store
            .eval(
                script,
                &[
                    bucket,
                    keys::plan_bucket(plan.next_run),
                    keys::PLAN_SCHEDULE.to_string(),
                    keys::plan(plan_id),
                ],
                &[
                    plan_id.to_string(),
                    plan.next_run.to_string(),
                    plan.encode()?,
                    ts.to_string(),
                ],
            )
            .await?;
        match reply.first().map(String::as_str) {
            Some("moved") => {
                debug!(plan_id = %plan_id, next_run = plan.next_run, "Plan re-armed");
            }
            Some("gone") => {
                info!(plan_id = %plan_id, "Plan deleted while firing");
            }
            _ => return Err(unexpected_reply(script, &reply).into()),
        }

        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, QueuedJob, RecurrenceInterval};
    use crate::store::MemoryStore;

    fn scheduler() -> (Arc<MemoryStore>, PlannedScheduler) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = PlannedScheduler::new(store.clone());
        (store, scheduler)
    }

    fn every(secs: &str) -> RecurrenceInterval {
        secs.parse().unwrap()
    }

    #[tokio::test]
    async fn test_missed_occurrences_collapse_into_one() {
        let (store, scheduler) = scheduler();
        let plan = PlannedJob::new(Job::new("Report"), 100, &every("PT50S"));
        scheduler.schedule(&plan).await.unwrap();

        assert_eq!(scheduler.execute(320).await.unwrap(), 1);
        assert_eq!(store.llen("queue:default").await.unwrap(), 1);
        let raw = store.rpop("queue:default").await.unwrap().unwrap();
        assert_eq!(QueuedJob::decode(&raw).unwrap().job.class, "Report");

        let stored = scheduler.get(&plan.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run, 350);
        assert_eq!(
            store.lrange("plan_schedule:350", 0, -1).await.unwrap(),
            vec![plan.id.clone()]
        );
        assert!(store.lrange("plan_schedule:100", 0, -1).await.unwrap().is_empty());
        assert!(store.zscore("plan_schedule", "100").await.unwrap().is_none());
        assert_eq!(store.zscore("plan_schedule", "350").await.unwrap(), Some(350.0));
    }

    #[tokio::test]
    async fn test_not_due_plan_does_not_fire() {
        let (store, scheduler) = scheduler();
        let plan = PlannedJob::new(Job::new("Report"), 500, &every("PT50S"));
        scheduler.schedule(&plan).await.unwrap();

        assert_eq!(scheduler.execute(499).await.unwrap(), 0);
        assert_eq!(store.llen("queue:default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let (store, scheduler) = scheduler();
        let later = PlannedJob::new(Job::new("B"), 900, &every("PT1H"));
        let sooner = PlannedJob::new(Job::new("A"), 300, &every("P1D"));
        scheduler.schedule(&later).await.unwrap();
        scheduler.schedule(&sooner).await.unwrap();

        let listed: Vec<String> = scheduler
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.job.class)
            .collect();
        assert_eq!(listed, vec!["A", "B"]);

        scheduler.remove(&sooner.id).await.unwrap();
        assert!(scheduler.get(&sooner.id).await.unwrap().is_none());
        assert!(store.zscore("plan_schedule", "300").await.unwrap().is_none());
        assert!(matches!(
            scheduler.remove(&sooner.id).await,
            Err(SchedulerError::PlanNotFound(_))
        ));
        assert_eq!(scheduler.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_moves_bucket() {
        let (store, scheduler) = scheduler();
        let mut plan = PlannedJob::new(Job::new("A"), 300, &every("PT10S"));
        scheduler.schedule(&plan).await.unwrap();

        plan.next_run = 400;
        scheduler.schedule(&plan).await.unwrap();
        assert!(store.zscore("plan_schedule", "300").await.unwrap().is_none());
        assert_eq!(store.llen("plan_schedule:400").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deleted_plan_id_is_dropped_from_bucket() {
        let (store, scheduler) = scheduler();
        store.lpush("plan_schedule:100", "ghost").await.unwrap();
        store.zadd("plan_schedule", "100", 100.0).await.unwrap();

        assert_eq!(scheduler.execute(100).await.unwrap(), 0);
        assert!(store.keys().iter().all(|k| !k.starts_with("plan_schedule")));
    }

    #[tokio::test]
    async fn test_pool_plan_without_source_rejected() {
        let (store, scheduler) = scheduler();
        let plan = PlannedJob::new(Job::new("A"), 100, &every("PT10S"))
            .with_target(crate::job::Destination::pool("reports", "a"));
        assert!(matches!(
            scheduler.schedule(&plan).await,
            Err(SchedulerError::Enqueue(EnqueueError::Pool(_)))
        ));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_unenqueueable_plan_is_removed_and_later_plans_fire() {
        let (store, scheduler) = scheduler();
        let broken = PlannedJob::new(Job::new("NoSource"), 100, &every("PT10S"))
            .with_target(crate::job::Destination::pool("reports", "a"));
        store.set(&keys::plan(&broken.id), &broken.encode().unwrap()).await.unwrap();
        store.sadd(keys::PLAN_INDEX, &broken.id).await.unwrap();
        store.lpush("plan_schedule:100", &broken.id).await.unwrap();
        store.zadd(keys::PLAN_SCHEDULE, "100", 100.0).await.unwrap();

        let healthy = PlannedJob::new(Job::new("Healthy"), 200, &every("PT1H"));
        scheduler.schedule(&healthy).await.unwrap();

        assert_eq!(scheduler.execute(1_000).await.unwrap(), 1);
        let raw = store.rpop("queue:default").await.unwrap().unwrap();
        assert_eq!(QueuedJob::decode(&raw).unwrap().job.class, "Healthy");

        assert!(scheduler.get(&broken.id).await.unwrap().is_none());
        assert!(store.zscore(keys::PLAN_SCHEDULE, "100").await.unwrap().is_none());
        assert_eq!(scheduler.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_interval_rejected() {
        let (_store, scheduler) = scheduler();
        let mut plan = PlannedJob::new(Job::new("A"), 100, &every("PT10S"));
        plan.recurrence_interval = "whenever".to_string();
        assert!(matches!(
            scheduler.schedule(&plan).await,
            Err(SchedulerError::InvalidInterval(_))
        ));
    }
}
