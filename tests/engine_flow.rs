//! End-to-end flows against the in-memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use jobforge::identity::WorkerImage;
use jobforge::job::{Destination, Job, PlannedJob, QueuedJob, RecurrenceInterval, UniqueDescriptor};
use jobforge::maintainer::PoolMaintainer;
use jobforge::pool::{AllocationResult, BatchAllocator, BatchPoolAssigner};
use jobforge::queue::{BatchPoolSource, BufferedSource, Producer};
use jobforge::scheduler::{DelayedScheduler, PlannedScheduler, SchedulerLoop};
use jobforge::store::{keys, KeyValueStore, MemoryStore};
use jobforge::unique::{UniqueCoordinator, UniqueStateName};
use jobforge::worker::{
    ExecutionOutcome, JobExecutor, SleepStrategy, StopReason, TerminateDecorator, WorkerLoop,
};

/// Replays scripted outcomes and records each run together with the unique
/// state observed while it executed.
struct RecordingExecutor {
    store: Arc<MemoryStore>,
    outcomes: Mutex<VecDeque<ExecutionOutcome>>,
    runs: Mutex<Vec<(QueuedJob, Option<UniqueStateName>)>>,
}

impl RecordingExecutor {
    fn new(store: Arc<MemoryStore>, outcomes: Vec<ExecutionOutcome>) -> Arc<Self> {
        Arc::new(Self {
            store,
            outcomes: Mutex::new(outcomes.into()),
            runs: Mutex::new(Vec::new()),
        })
    }

    fn runs(&self) -> Vec<(QueuedJob, Option<UniqueStateName>)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, job: &QueuedJob) -> ExecutionOutcome {
        let state = match job.job.unique_id() {
            Some(uid) => UniqueCoordinator::new(self.store.clone())
                .state(uid)
                .await
                .unwrap()
                .map(|s| s.name),
            None => None,
        };
        self.runs.lock().unwrap().push((job.clone(), state));
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ExecutionOutcome::Success)
    }
}

/// Slow executor tracking how many jobs run at once.
struct OverlapExecutor {
    active: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

#[async_trait]
impl JobExecutor for OverlapExecutor {
    async fn execute(&self, _job: &QueuedJob) -> ExecutionOutcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        ExecutionOutcome::Success
    }
}

fn queue_worker(
    store: &Arc<MemoryStore>,
    code: &str,
    executor: Arc<dyn JobExecutor>,
    idle_waits: u32,
) -> WorkerLoop {
    let image = WorkerImage::new("n1", "default", code, 100).unwrap();
    let source = BufferedSource::new(store.clone(), "default", image.buffer_key());
    let strategy =
        TerminateDecorator::new(SleepStrategy::new(Duration::from_millis(10)), idle_waits);
    WorkerLoop::new(image, store.clone(), Box::new(source), Box::new(strategy), executor)
}

fn unit_worker(store: &Arc<MemoryStore>, executor: Arc<dyn JobExecutor>) -> WorkerLoop {
    let image = WorkerImage::new("n1", "reports", "u0", 100).unwrap();
    let source = BatchPoolSource::new(store.clone(), "reports", 0, image.buffer_key());
    let strategy = TerminateDecorator::new(SleepStrategy::new(Duration::from_millis(1)), 1);
    WorkerLoop::new(image, store.clone(), Box::new(source), Box::new(strategy), executor)
}

async fn run_to_stop(worker: &mut WorkerLoop) -> StopReason {
    let (_tx, rx) = broadcast::channel(1);
    tokio::time::timeout(Duration::from_secs(10), worker.run(rx))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_unique_job_retry_then_success() {
    let store = Arc::new(MemoryStore::new());
    store.sadd(keys::QUEUE_REGISTRY, "default").await.unwrap();

    let job = Job::new("X")
        .with_source_id("s1")
        .with_name("n1")
        .with_unique(UniqueDescriptor::new("u1"));
    let first_id = Producer::new(store.clone())
        .enqueue(&Destination::default(), job)
        .await
        .unwrap();

    // A duplicate is rejected while the first copy is queued.
    let duplicate = Producer::new(store.clone())
        .enqueue(
            &Destination::default(),
            Job::new("X").with_unique(UniqueDescriptor::new("u1")),
        )
        .await;
    assert!(duplicate.is_err());

    let executor = RecordingExecutor::new(
        store.clone(),
        vec![ExecutionOutcome::Retry("transient".to_string())],
    );
    let mut worker = queue_worker(&store, "w0", executor.clone(), 1);
    assert_eq!(run_to_stop(&mut worker).await, StopReason::Terminated);

    let runs = executor.runs();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].0.id, first_id);
    assert_eq!(runs[0].0.job.fail_count, 0);
    assert_eq!(runs[1].0.job.fail_count, 1);
    assert_eq!(runs[1].0.job.source_id.as_deref(), Some("s1"));
    assert_eq!(runs[1].0.job.display_name(), "n1");
    // The retried copy was locked afresh.
    assert_eq!(runs[0].1, Some(UniqueStateName::Running));
    assert_eq!(runs[1].1, Some(UniqueStateName::Running));

    assert!(UniqueCoordinator::new(store.clone())
        .state("u1")
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.llen("queue:default").await.unwrap(), 0);
    assert_eq!(store.llen(keys::FAILED_JOBS).await.unwrap(), 0);
}

#[tokio::test]
async fn test_deferred_duplicates_never_overlap() {
    let store = Arc::new(MemoryStore::new());
    store.sadd(keys::QUEUE_REGISTRY, "default").await.unwrap();

    let producer = Producer::new(store.clone());
    for _ in 0..2 {
        producer
            .enqueue(
                &Destination::default(),
                Job::new("Refresh").with_unique(UniqueDescriptor::deferrable("acct-9", 0)),
            )
            .await
            .unwrap();
    }
    assert_eq!(store.llen("queue:default").await.unwrap(), 2);

    let executor = Arc::new(OverlapExecutor {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        total: AtomicUsize::new(0),
    });
    let mut a = queue_worker(&store, "w0", executor.clone(), 50);
    let mut b = queue_worker(&store, "w1", executor.clone(), 50);
    let (stop_a, stop_b) = tokio::join!(run_to_stop(&mut a), run_to_stop(&mut b));
    assert_eq!(stop_a, StopReason::Terminated);
    assert_eq!(stop_b, StopReason::Terminated);

    assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
    assert_eq!(executor.total.load(Ordering::SeqCst), 2);
    assert!(UniqueCoordinator::new(store.clone())
        .state("acct-9")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_batch_pool_runs_one_batch_per_source_at_a_time() {
    let store = Arc::new(MemoryStore::new());
    PoolMaintainer::new(store.clone(), "reports")
        .rebalance(1, 1)
        .await
        .unwrap();

    let producer = Producer::new(store.clone());
    for suffix in ["a", "b"] {
        producer
            .enqueue(
                &Destination::pool("reports", suffix),
                Job::new("Report").with_source_id("s1").with_arg("part", suffix),
            )
            .await
            .unwrap();
    }

    let allocator = BatchAllocator::new(store.clone(), "reports");
    assert!(matches!(
        allocator.allocate_once().await.unwrap(),
        AllocationResult::Assigned { unit: 0, .. }
    ));
    assert!(matches!(
        allocator.allocate_once().await.unwrap(),
        AllocationResult::Backlogged { .. }
    ));

    let executor = RecordingExecutor::new(store.clone(), Vec::new());
    let mut worker = unit_worker(&store, executor.clone());
    assert_eq!(run_to_stop(&mut worker).await, StopReason::Terminated);
    assert_eq!(executor.runs().len(), 1);

    // Exhausting the first batch released the second one.
    assert!(matches!(
        allocator.allocate_once().await.unwrap(),
        AllocationResult::Assigned { unit: 0, .. }
    ));
    let mut worker = unit_worker(&store, executor.clone());
    assert_eq!(run_to_stop(&mut worker).await, StopReason::Terminated);

    let parts: Vec<_> = executor
        .runs()
        .iter()
        .map(|(queued, _)| queued.job.args["part"].clone())
        .collect();
    assert_eq!(parts, vec!["a", "b"]);

    // Unit score still matches its (now empty) list.
    let units = BatchPoolAssigner::new(store.clone(), "reports")
        .units()
        .await
        .unwrap();
    assert_eq!(units, vec![(0, 0)]);
    assert_eq!(store.llen(&keys::unit_queue("reports", 0)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delayed_job_fires_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    DelayedScheduler::new(store.clone())
        .schedule(1_000, &Destination::queue("mail"), Job::new("Send"))
        .await
        .unwrap();

    let scheduler = SchedulerLoop::new(store.clone());
    assert_eq!(scheduler.tick_once(999).await.unwrap(), 0);
    assert_eq!(scheduler.tick_once(5_000).await.unwrap(), 1);
    assert_eq!(scheduler.tick_once(5_001).await.unwrap(), 0);

    assert_eq!(store.llen("queue:mail").await.unwrap(), 1);
    assert_eq!(store.llen(&keys::delayed_bucket(1_000)).await.unwrap(), 0);
    assert!(store
        .zrangebyscore(keys::DELAYED_SCHEDULE, f64::NEG_INFINITY, f64::INFINITY, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_planned_job_catches_up_to_next_occurrence() {
    let store = Arc::new(MemoryStore::new());
    let planner = PlannedScheduler::new(store.clone());
    let plan = PlannedJob::new(
        Job::new("Digest"),
        100,
        &RecurrenceInterval::from_secs(50).unwrap(),
    )
    .with_target(Destination::queue("digest"));
    planner.schedule(&plan).await.unwrap();

    let scheduler = SchedulerLoop::new(store.clone());
    assert_eq!(scheduler.tick_once(320).await.unwrap(), 1);
    assert_eq!(store.llen("queue:digest").await.unwrap(), 1);

    let stored = planner.get(&plan.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run, 350);

    assert_eq!(scheduler.tick_once(349).await.unwrap(), 0);
    assert_eq!(scheduler.tick_once(350).await.unwrap(), 1);
    assert_eq!(store.llen("queue:digest").await.unwrap(), 2);
}
