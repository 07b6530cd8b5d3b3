//! Worker main loop.
//!
//! A [`WorkerLoop`] reserves jobs from one [`JobSource`] through a
//! [`ReservationStrategy`], takes the unique lock, runs the job on a
//! separate task through its [`JobExecutor`], then settles the outcome:
//!
//! | Outcome | Effect |
//! |---|---|
//! | success | unique lock released, deferred copy re-enqueued |
//! | retry | re-enqueued with `failCount + 1`, or failed once `maxFails` is reached |
//! | reschedule | handed to the delayed scheduler, `failCount` unchanged |
//! | fail | recorded in `failed_jobs`, unique lock released |
//!
//! The reservation is acknowledged only after it has been settled, so a
//! crash leaves the payload in the worker buffer for [`recover_buffer`].
//! A store error that breaks off handling in a live worker puts the job
//! back into its origin instead.

mod executor;
mod recovery;
mod strategy;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{EnqueueError, ReserveError, SourceError, UniqueError, WorkerError};
use crate::identity::WorkerImage;
use crate::job::{Destination, Job, QueuedJob};
use crate::maintainer::ProcessRegistry;
use crate::metrics::MetricsCollector;
use crate::queue::{JobSource, Producer, Reservation};
use crate::scheduler::DelayedScheduler;
use crate::store::{keys, now_epoch, KeyValueStore};
use crate::unique::UniqueCoordinator;

pub use self::executor::{CommandExecutor, ExecutionOutcome, JobExecutor, RETRY_EXIT_CODE};
pub use self::recovery::recover_buffer;
pub use self::strategy::{
    BlockingStrategy, ReservationStrategy, SleepStrategy, TerminateDecorator,
    DEFAULT_TERMINATE_AFTER_WAITS,
};

/// Default number of attempts before a retried job fails for good.
pub const DEFAULT_MAX_FAILS: u32 = 3;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Non-blocking check of a shutdown channel.
///
/// A closed channel counts as a shutdown request.
pub fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => return true,
            // Missed signals still mean shutdown was sent; check again.
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(broadcast::error::TryRecvError::Empty) => return false,
        }
    }
}

/// Why a worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    /// The strategy reported the source as drained.
    Terminated,
    /// The source can no longer yield jobs (queue deregistered, unit retired).
    SourceUnavailable,
}

/// How far handling of a reservation got before it broke off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Reserved,
    /// The unique lock is held by this worker.
    Locked,
    /// The job must not run again; only its buffer entry is outstanding.
    Settled,
}

/// Single-source worker.
pub struct WorkerLoop {
    image: WorkerImage,
    store: Arc<dyn KeyValueStore>,
    source: Box<dyn JobSource>,
    strategy: Box<dyn ReservationStrategy>,
    executor: Arc<dyn JobExecutor>,
    unique: UniqueCoordinator,
    producer: Producer,
    delayed: DelayedScheduler,
    registry: ProcessRegistry,
    metrics: MetricsCollector,
    max_fails: u32,
    job_timeout: Option<Duration>,
}

impl WorkerLoop {
    pub fn new(
        image: WorkerImage,
        store: Arc<dyn KeyValueStore>,
        source: Box<dyn JobSource>,
        strategy: Box<dyn ReservationStrategy>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            image,
            unique: UniqueCoordinator::new(store.clone()),
            producer: Producer::new(store.clone()),
            delayed: DelayedScheduler::new(store.clone()),
            registry: ProcessRegistry::new(store.clone()),
            store,
            source,
            strategy,
            executor,
            metrics: MetricsCollector::new(),
            max_fails: DEFAULT_MAX_FAILS,
            job_timeout: None,
        }
    }

    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails.max(1);
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Option<Duration>) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_stale_lock_after(mut self, stale_after: Duration) -> Self {
        self.unique = UniqueCoordinator::new(self.store.clone()).with_stale_after(stale_after);
        self
    }

    pub fn image(&self) -> &WorkerImage {
        &self.image
    }

    /// Runs until shutdown, termination, source loss or an invariant
    /// violation. The worker is registered for the duration of the call.
    pub async fn run(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<StopReason, WorkerError> {
        self.registry.register_worker(&self.image).await?;
        self.metrics.worker_started();
        info!(worker = %self.image, source = %self.source.name(), "Worker started");

        let result = self.reserve_loop(&mut shutdown).await;

        self.metrics.worker_stopped();
        if let Err(e) = self.registry.unregister_worker(&self.image).await {
            warn!(worker = %self.image, error = %e, "Failed to unregister worker");
        }
        match &result {
            Ok(reason) => info!(worker = %self.image, reason = ?reason, "Worker stopped"),
            Err(e) => error!(critical = true, worker = %self.image, error = %e, "Worker aborted"),
        }
        result
    }

    async fn reserve_loop(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<StopReason, WorkerError> {
        while !shutdown_requested(shutdown) {
            match self.strategy.reserve(self.source.as_ref()).await {
                Ok(reservation) => {
                    if let Err(e) = self.process(reservation).await {
                        if e.is_invariant_violation() {
                            return Err(e);
                        }
                        error!(worker = %self.image, error = %e, "Job handling failed");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
                Err(ReserveError::WaitTimeout) => {
                    debug!(worker = %self.image, "No job reserved");
                }
                Err(ReserveError::Terminate) => return Ok(StopReason::Terminated),
                Err(ReserveError::Source(SourceError::Unavailable(name))) => {
                    info!(worker = %self.image, source = %name, "Source no longer available");
                    return Ok(StopReason::SourceUnavailable);
                }
                Err(ReserveError::Source(e)) => {
                    error!(worker = %self.image, error = %e, "Failed to reserve job");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
        Ok(StopReason::Shutdown)
    }

    /// Handles one reserved job end to end.
    ///
    /// If handling breaks off with anything but an invariant violation,
    /// the job is restored to its origin and cleared from the buffer
    /// before the error is returned.
    pub async fn process(&self, reservation: Reservation) -> Result<(), WorkerError> {
        let mut progress = Progress::Reserved;
        let result = self.handle(&reservation, &mut progress).await;
        if let Err(e) = &result {
            if !e.is_invariant_violation() {
                self.restore(&reservation, progress).await;
            }
        }
        result
    }

    async fn handle(
        &self,
        reservation: &Reservation,
        progress: &mut Progress,
    ) -> Result<(), WorkerError> {
        self.metrics
            .record_reserved(self.source.kind(), reservation.job.latency(now_epoch()));
        let uid = reservation.job.job.unique_id().map(str::to_string);

        if let Some(uid) = &uid {
            if !self.take_lock(uid, reservation, progress).await? {
                *progress = Progress::Settled;
                self.source.ack(reservation).await?;
                return Ok(());
            }
        }

        self.registry
            .mark_running(&self.image, reservation.job.job.display_name(), uid.as_deref())
            .await?;
        let outcome = self.execute(&reservation.job).await;
        self.registry.clear_running(&self.image).await?;
        self.metrics.record_outcome(outcome.as_str());

        if matches!(outcome, ExecutionOutcome::Success) {
            *progress = Progress::Settled;
        }
        self.settle(reservation, uid.as_deref(), outcome).await?;
        *progress = Progress::Settled;
        self.source.ack(reservation).await?;
        Ok(())
    }

    /// Puts a job whose handling broke off back into its origin, then
    /// removes its payload from the buffer. A held lock is released first
    /// so the restored copy can lock again. On failure the payload stays
    /// buffered for [`recover_buffer`].
    async fn restore(&self, reservation: &Reservation, progress: Progress) {
        let queued = &reservation.job;
        let restored = match (progress, queued.job.unique_id()) {
            (Progress::Settled, _) => Ok(()),
            (Progress::Locked, Some(uid)) => {
                match self.release(Some(uid), &reservation.origin).await {
                    Ok(()) => self.enqueue_to(&reservation.origin, queued.job.clone()).await,
                    Err(e) => Err(e),
                }
            }
            _ => self
                .producer
                .restore(&reservation.origin, &queued.job, &reservation.payload)
                .await
                .map_err(WorkerError::from),
        };
        if let Err(e) = restored {
            error!(
                worker = %self.image,
                job_id = %queued.id,
                raw = %reservation.payload,
                error = %e,
                "Failed to restore interrupted job"
            );
            return;
        }

        let buffer = reservation
            .buffer
            .clone()
            .unwrap_or_else(|| self.image.buffer_key());
        if let Err(e) = self.store.lrem(&buffer, -1, &reservation.payload).await {
            warn!(worker = %self.image, job_id = %queued.id, error = %e, "Failed to clear buffer");
            return;
        }
        if progress != Progress::Settled {
            info!(
                worker = %self.image,
                job_id = %queued.id,
                origin = %reservation.origin,
                "Interrupted job restored"
            );
        }
    }

    /// Returns `false` when the job was deferred or discarded behind a
    /// running copy.
    async fn take_lock(
        &self,
        uid: &str,
        reservation: &Reservation,
        progress: &mut Progress,
    ) -> Result<bool, WorkerError> {
        // Unbuffered payloads are staged in the worker buffer so the lock
        // script has a list to remove them from.
        let (lock_source, staged) = match &reservation.buffer {
            Some(buffer) => (buffer.clone(), false),
            None => {
                let buffer = self.image.buffer_key();
                self.store.lpush(&buffer, &reservation.payload).await?;
                (buffer, true)
            }
        };

        let locked = self
            .unique
            .lock(
                uid,
                &lock_source,
                &reservation.payload,
                reservation.job.job.is_deferrable(),
            )
            .await;
        if locked.is_ok() {
            *progress = Progress::Locked;
            if staged {
                self.store.lrem(&lock_source, -1, &reservation.payload).await?;
            }
        }

        match locked {
            Ok(()) => Ok(true),
            Err(UniqueError::Deferred(_)) => {
                self.metrics.record_outcome("deferred");
                Ok(false)
            }
            Err(UniqueError::Discarded(_)) => {
                self.metrics.record_outcome("discarded");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs the executor on its own task. A panic or timeout is a failure.
    async fn execute(&self, job: &QueuedJob) -> ExecutionOutcome {
        let executor = self.executor.clone();
        let owned = job.clone();
        let mut handle = tokio::spawn(async move { executor.execute(&owned).await });

        let joined = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return ExecutionOutcome::Fail(format!("timed out after {}s", limit.as_secs_f64()));
                }
            },
            None => handle.await,
        };

        joined.unwrap_or_else(|e| ExecutionOutcome::Fail(format!("job task aborted: {e}")))
    }

    async fn settle(
        &self,
        reservation: &Reservation,
        uid: Option<&str>,
        outcome: ExecutionOutcome,
    ) -> Result<(), WorkerError> {
        let queued = &reservation.job;
        match outcome {
            ExecutionOutcome::Success => {
                info!(worker = %self.image, job_id = %queued.id, class = %queued.job.class, "Job succeeded");
                self.release(uid, &reservation.origin).await
            }
            ExecutionOutcome::Retry(reason)
                if queued.job.fail_count >= self.max_fails.saturating_sub(1) =>
            {
                let reason = format!("{reason} (gave up after {} attempts)", queued.job.fail_count + 1);
                self.fail(reservation, uid, &reason).await
            }
            ExecutionOutcome::Retry(reason) => {
                if let Some(uid) = uid {
                    self.unique.remove_all(uid).await?;
                }
                let mut retry = queued.job.clone();
                retry.fail_count += 1;
                warn!(
                    worker = %self.image,
                    job_id = %queued.id,
                    class = %queued.job.class,
                    fail_count = retry.fail_count,
                    error = %reason,
                    "Job failed, retrying"
                );
                self.enqueue_to(&reservation.origin, retry).await
            }
            ExecutionOutcome::Reschedule { error, delay } => {
                if let Some(uid) = uid {
                    self.unique.remove_all(uid).await?;
                }
                let at = self
                    .delayed
                    .schedule_in(delay, &reservation.origin, queued.job.clone())
                    .await?;
                info!(
                    worker = %self.image,
                    job_id = %queued.id,
                    class = %queued.job.class,
                    at = at,
                    error = %error,
                    "Job rescheduled"
                );
                Ok(())
            }
            ExecutionOutcome::Fail(reason) => self.fail(reservation, uid, &reason).await,
        }
    }

    async fn fail(
        &self,
        reservation: &Reservation,
        uid: Option<&str>,
        reason: &str,
    ) -> Result<(), WorkerError> {
        error!(
            worker = %self.image,
            job_id = %reservation.job.id,
            class = %reservation.job.job.class,
            error = %reason,
            "Job failed permanently"
        );
        let record = json!({
            "job": reservation.job,
            "error": reason,
            "failed_at": chrono::Utc::now().to_rfc3339(),
            "worker": self.image.to_string(),
        });
        self.store.lpush(keys::FAILED_JOBS, &record.to_string()).await?;
        self.release(uid, &reservation.origin).await
    }

    /// Unlocks `uid` and re-enqueues the copy deferred behind it.
    async fn release(&self, uid: Option<&str>, origin: &Destination) -> Result<(), WorkerError> {
        let Some(uid) = uid else {
            return Ok(());
        };

        let deferred = match self.unique.unlock(uid).await {
            Ok(Some(deferred)) => deferred,
            Ok(None) => return Ok(()),
            Err(UniqueError::MissingLock(_)) => {
                warn!(worker = %self.image, unique_id = %uid, "Unique lock was already cleared");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let job = match QueuedJob::decode(&deferred) {
            Ok(queued) => queued.job,
            Err(e) => {
                error!(unique_id = %uid, raw = %e.raw(), error = %e, "Dropping corrupt deferred payload");
                return Ok(());
            }
        };

        match job.unique.as_ref().and_then(|u| u.deferrable_by).filter(|secs| *secs > 0) {
            Some(secs) => {
                let at = self
                    .delayed
                    .schedule_in(Duration::from_secs(secs), origin, job)
                    .await?;
                debug!(unique_id = %uid, at = at, "Deferred job delayed");
                Ok(())
            }
            None => {
                debug!(unique_id = %uid, "Re-enqueuing deferred job");
                self.enqueue_to(origin, job).await
            }
        }
    }

    async fn enqueue_to(&self, origin: &Destination, job: Job) -> Result<(), WorkerError> {
        match self.producer.enqueue(origin, job).await {
            Ok(_) => Ok(()),
            Err(EnqueueError::UniqueConflict(uid)) => {
                info!(unique_id = %uid, destination = %origin, "Copy already queued, not re-enqueuing");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::job::UniqueDescriptor;
    use crate::queue::{BufferedSource, FifoSource};
    use crate::store::{FlakyStore, MemoryStore};
    use crate::unique::{UniqueState, UniqueStateName};

    /// Executor replaying scripted outcomes and recording what it ran.
    struct ScriptedExecutor {
        outcomes: Mutex<VecDeque<ExecutionOutcome>>,
        ran: Mutex<Vec<QueuedJob>>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<ExecutionOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ran: Mutex::new(Vec::new()),
            })
        }

        fn ran(&self) -> Vec<QueuedJob> {
            self.ran.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        async fn execute(&self, job: &QueuedJob) -> ExecutionOutcome {
            self.ran.lock().unwrap().push(job.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ExecutionOutcome::Success)
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl JobExecutor for PanickingExecutor {
        async fn execute(&self, _job: &QueuedJob) -> ExecutionOutcome {
            panic!("boom");
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl JobExecutor for SlowExecutor {
        async fn execute(&self, _job: &QueuedJob) -> ExecutionOutcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ExecutionOutcome::Success
        }
    }

    fn running_state() -> String {
        UniqueState::now(UniqueStateName::Running).to_string()
    }

    fn image() -> WorkerImage {
        WorkerImage::new("n1", "default", "w0", 42).unwrap()
    }

    async fn flaky_worker(store: &Arc<FlakyStore>, executor: Arc<dyn JobExecutor>) -> WorkerLoop {
        store.sadd(keys::QUEUE_REGISTRY, "default").await.unwrap();
        let source = BufferedSource::new(store.clone(), "default", image().buffer_key());
        let strategy = TerminateDecorator::new(SleepStrategy::new(Duration::from_millis(1)), 1);
        WorkerLoop::new(image(), store.clone(), Box::new(source), Box::new(strategy), executor)
    }

    async fn worker(store: &Arc<MemoryStore>, executor: Arc<dyn JobExecutor>) -> WorkerLoop {
        store.sadd(keys::QUEUE_REGISTRY, "default").await.unwrap();
        let source = BufferedSource::new(store.clone(), "default", image().buffer_key());
        let strategy = TerminateDecorator::new(SleepStrategy::new(Duration::from_millis(1)), 1);
        WorkerLoop::new(image(), store.clone(), Box::new(source), Box::new(strategy), executor)
    }

    async fn run_until_drained(worker: &mut WorkerLoop) -> StopReason {
        let (_tx, rx) = broadcast::channel(1);
        tokio::time::timeout(Duration::from_secs(5), worker.run(rx))
            .await
            .unwrap()
            .unwrap()
    }

    async fn enqueue(store: &Arc<MemoryStore>, job: Job) {
        Producer::new(store.clone())
            .enqueue(&Destination::queue("default"), job)
            .await
            .unwrap();
    }

    #[test]
    fn test_shutdown_requested() {
        let (tx, mut rx) = broadcast::channel(1);
        assert!(!shutdown_requested(&mut rx));
        tx.send(()).unwrap();
        assert!(shutdown_requested(&mut rx));

        let (tx, mut rx) = broadcast::channel::<()>(1);
        drop(tx);
        assert!(shutdown_requested(&mut rx));
    }

    #[tokio::test]
    async fn test_retry_then_permanent_fail() {
        let store = Arc::new(MemoryStore::new());
        let executor = ScriptedExecutor::new(vec![
            ExecutionOutcome::Retry("flaky".into()),
            ExecutionOutcome::Retry("flaky".into()),
            ExecutionOutcome::Retry("flaky".into()),
        ]);
        let mut worker = worker(&store, executor.clone()).await.with_max_fails(3);
        enqueue(&store, Job::new("Flaky").with_unique(UniqueDescriptor::new("u1"))).await;

        assert_eq!(run_until_drained(&mut worker).await, StopReason::Terminated);

        let counts: Vec<u32> = executor.ran().iter().map(|j| j.job.fail_count).collect();
        assert_eq!(counts, vec![0, 1, 2]);
        assert_eq!(store.llen(keys::FAILED_JOBS).await.unwrap(), 1);
        assert!(store.get("unique:u1:state").await.unwrap().is_none());
        assert_eq!(store.llen(&image().buffer_key()).await.unwrap(), 0);
        assert!(store.hgetall(&image().runtime_key()).await.unwrap().is_empty());
        assert!(!store
            .sismember(keys::WORKER_REGISTRY, &image().to_string())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_success_requeues_deferred_copy() {
        let store = Arc::new(MemoryStore::new());
        let executor = ScriptedExecutor::new(vec![]);
        let worker = worker(&store, executor.clone()).await;

        // A copy is already running when this one is locked.
        store.set("unique:u1:state", &running_state()).await.unwrap();
        let deferred =
            QueuedJob::new(Job::new("Sync").with_unique(UniqueDescriptor::deferrable("u1", 0)));
        store.set("unique:u1:deferred", &deferred.encode().unwrap()).await.unwrap();

        worker.release(Some("u1"), &Destination::queue("default")).await.unwrap();

        let raw = store.rpop("queue:default").await.unwrap().unwrap();
        assert_eq!(QueuedJob::decode(&raw).unwrap().job.class, "Sync");
        assert_eq!(
            crate::unique::UniqueCoordinator::new(store.clone())
                .state("u1")
                .await
                .unwrap()
                .map(|s| s.name),
            Some(UniqueStateName::Queued)
        );
    }

    #[tokio::test]
    async fn test_deferred_copy_with_delay_goes_to_scheduler() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store, ScriptedExecutor::new(vec![])).await;
        store.set("unique:u1:state", "running:1.0").await.unwrap();
        let deferred =
            QueuedJob::new(Job::new("Sync").with_unique(UniqueDescriptor::deferrable("u1", 30)));
        store.set("unique:u1:deferred", &deferred.encode().unwrap()).await.unwrap();

        worker.release(Some("u1"), &Destination::queue("default")).await.unwrap();

        assert_eq!(store.llen("queue:default").await.unwrap(), 0);
        assert_eq!(
            store
                .zrangebyscore(keys::DELAYED_SCHEDULE, f64::NEG_INFINITY, f64::INFINITY, None)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reschedule_keeps_fail_count() {
        let store = Arc::new(MemoryStore::new());
        let executor = ScriptedExecutor::new(vec![ExecutionOutcome::Reschedule {
            error: "busy".into(),
            delay: Duration::from_secs(60),
        }]);
        let mut worker = worker(&store, executor).await;
        enqueue(&store, Job::new("Busy").with_unique(UniqueDescriptor::new("u1"))).await;

        run_until_drained(&mut worker).await;

        assert!(store.get("unique:u1:state").await.unwrap().is_none());
        let schedule = store
            .zrangebyscore(keys::DELAYED_SCHEDULE, f64::NEG_INFINITY, f64::INFINITY, None)
            .await
            .unwrap();
        let bucket = keys::delayed_bucket(schedule[0].parse().unwrap());
        let raw = store.rpop(&bucket).await.unwrap().unwrap();
        let entry: crate::job::ScheduledEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.job.fail_count, 0);
        assert_eq!(entry.target, Destination::queue("default"));
    }

    #[tokio::test]
    async fn test_store_error_before_execution_restores_unique_job() {
        let memory = Arc::new(MemoryStore::new());
        let store = FlakyStore::new(memory.clone(), "hset", 1);
        let executor = ScriptedExecutor::new(vec![]);
        let mut worker = flaky_worker(&store, executor.clone()).await;
        enqueue(&memory, Job::new("Sync").with_unique(UniqueDescriptor::new("u1"))).await;

        assert_eq!(run_until_drained(&mut worker).await, StopReason::Terminated);

        assert_eq!(executor.ran().len(), 1);
        assert_eq!(executor.ran()[0].job.class, "Sync");
        assert_eq!(memory.llen(&image().buffer_key()).await.unwrap(), 0);
        assert_eq!(memory.llen("queue:default").await.unwrap(), 0);
        assert!(memory.get("unique:u1:state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_error_after_execution_runs_job_again() {
        let memory = Arc::new(MemoryStore::new());
        let store = FlakyStore::new(memory.clone(), "del", 1);
        let executor = ScriptedExecutor::new(vec![]);
        let mut worker = flaky_worker(&store, executor.clone()).await;
        enqueue(&memory, Job::new("Plain")).await;

        assert_eq!(run_until_drained(&mut worker).await, StopReason::Terminated);

        let ran = executor.ran();
        assert_eq!(ran.len(), 2);
        assert_eq!(ran[0].id, ran[1].id);
        assert_eq!(memory.llen(&image().buffer_key()).await.unwrap(), 0);
        assert_eq!(memory.llen("queue:default").await.unwrap(), 0);
        assert_eq!(memory.llen(keys::FAILED_JOBS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_fails() {
        let store = Arc::new(MemoryStore::new());
        let mut worker = worker(&store, Arc::new(PanickingExecutor)).await;
        enqueue(&store, Job::new("Boom")).await;

        run_until_drained(&mut worker).await;
        assert_eq!(store.llen(keys::FAILED_JOBS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let mut worker = worker(&store, Arc::new(SlowExecutor))
            .await
            .with_job_timeout(Some(Duration::from_millis(20)));
        enqueue(&store, Job::new("Slow")).await;

        run_until_drained(&mut worker).await;
        let raw = store.rpop(keys::FAILED_JOBS).await.unwrap().unwrap();
        assert!(raw.contains("timed out"));
    }

    #[tokio::test]
    async fn test_running_copy_discards_unbuffered_duplicate() {
        let store = Arc::new(MemoryStore::new());
        store.sadd(keys::QUEUE_REGISTRY, "default").await.unwrap();
        let executor = ScriptedExecutor::new(vec![]);
        let source = FifoSource::new(store.clone(), "default");
        let strategy = TerminateDecorator::new(SleepStrategy::new(Duration::from_millis(1)), 1);
        let mut worker = WorkerLoop::new(
            image(),
            store.clone(),
            Box::new(source),
            Box::new(strategy),
            executor.clone(),
        );

        store.set("unique:u1:state", &running_state()).await.unwrap();
        let queued = QueuedJob::new(Job::new("Dup").with_unique(UniqueDescriptor::new("u1")));
        store.lpush("queue:default", &queued.encode().unwrap()).await.unwrap();

        run_until_drained(&mut worker).await;

        assert!(executor.ran().is_empty());
        assert_eq!(store.llen(&image().buffer_key()).await.unwrap(), 0);
        assert!(store.get("unique:u1:state").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_source_stops_worker() {
        let store = Arc::new(MemoryStore::new());
        let source = FifoSource::new(store.clone(), "gone");
        let strategy = SleepStrategy::new(Duration::from_millis(1));
        let mut worker = WorkerLoop::new(
            image(),
            store.clone(),
            Box::new(source),
            Box::new(strategy),
            ScriptedExecutor::new(vec![]),
        );
        assert_eq!(run_until_drained(&mut worker).await, StopReason::SourceUnavailable);
    }
}
