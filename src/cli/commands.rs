//! CLI command definitions for jobforge.
//!
//! Long-running commands (`worker`, `allocator`, `scheduler`) stop on
//! Ctrl-C. Management commands run once and print their result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{EngineConfig, PoolLayout};
use crate::identity::{AllocatorImage, SchedulerImage, WorkerImage};
use crate::job::{Destination, Job, PlannedJob, RecurrenceInterval, UniqueDescriptor};
use crate::maintainer::{unit_code, LocalProcessProbe, Maintainer, PoolMaintainer, ProcessRegistry};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::pool::BatchAllocator;
use crate::queue::{BatchPoolSource, BufferedSource, JobSource, Producer};
use crate::scheduler::{DelayedScheduler, PlannedScheduler, SchedulerLoop};
use crate::store::{keys, now_epoch, KeyValueStore, RedisStore};
use crate::worker::{
    recover_buffer, BlockingStrategy, CommandExecutor, JobExecutor, ReservationStrategy,
    SleepStrategy, StopReason, TerminateDecorator, WorkerLoop,
};

/// Distributed job-queue engine over a shared Redis store.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Run workers, allocators and schedulers for a shared Redis job queue")]
#[command(version)]
#[command(
    long_about = "jobforge runs the processes of a Redis-backed job queue: FIFO and batch-pool workers, pool allocators and the delayed/planned scheduler.\n\nConnection settings come from the environment (JOBFORGE_REDIS_URL, JOBFORGE_NODE_ID, ...).\n\nExample usage:\n  jobforge enqueue --queue default --class Sync --args '{\"id\": 1}'\n  jobforge worker --queue default --workers 4 --program-dir ./jobs"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run workers on a queue or on one unit of a batch pool.
    Worker(WorkerArgs),

    /// Run the batch allocator of a pool.
    Allocator(AllocatorArgs),

    /// Run the delayed and planned job scheduler.
    Scheduler,

    /// Enqueue a job, optionally delayed.
    Enqueue(EnqueueArgs),

    /// Manage planned (recurring) jobs.
    Plan(PlanArgs),

    /// Resize the units of a batch pool.
    Rebalance(RebalanceArgs),

    /// Move a dead worker's buffer to the orphaned jobs list.
    Recover(RecoverArgs),

    /// Cull dead processes on this node and report capacity against a layout.
    Reconcile(ReconcileArgs),

    /// Print metrics in Prometheus text format.
    Metrics,
}

/// Where a job goes. `--queue` and `--pool` are exclusive; the default
/// queue is used when neither is given.
#[derive(clap::Args, Debug)]
pub struct TargetArgs {
    /// FIFO queue name.
    #[arg(long, conflicts_with = "pool")]
    pub queue: Option<String>,

    /// Batch pool name.
    #[arg(long)]
    pub pool: Option<String>,

    /// Batch suffix inside the pool.
    #[arg(long, default_value = "", requires = "pool")]
    pub suffix: String,
}

impl TargetArgs {
    fn destination(&self) -> Destination {
        match (&self.queue, &self.pool) {
            (_, Some(pool)) => Destination::pool(pool.clone(), self.suffix.clone()),
            (Some(queue), None) => Destination::queue(queue.clone()),
            (None, None) => Destination::default(),
        }
    }
}

/// Arguments for the `worker` command.
#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    /// Queue to consume.
    #[arg(long, conflicts_with = "pool", required_unless_present = "pool")]
    pub queue: Option<String>,

    /// Batch pool to consume; requires `--unit`.
    #[arg(long, requires = "unit")]
    pub pool: Option<String>,

    /// Pool unit this worker serves.
    #[arg(long)]
    pub unit: Option<u32>,

    /// Number of concurrent queue workers in this process.
    #[arg(short, long, default_value = "1", conflicts_with = "pool")]
    pub workers: u32,

    /// Poll with sleeps instead of blocking pops.
    #[arg(long)]
    pub sleep: bool,

    /// Directory holding job programs. Classes resolve only inside it.
    #[arg(long)]
    pub program_dir: PathBuf,
}

/// Arguments for the `allocator` command.
#[derive(clap::Args, Debug)]
pub struct AllocatorArgs {
    /// Batch pool to allocate.
    #[arg(long)]
    pub pool: String,

    /// Idle poll interval in milliseconds.
    #[arg(long, default_value = "500")]
    pub poll_ms: u64,
}

/// Arguments for the `enqueue` command.
#[derive(clap::Args, Debug)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Job class.
    #[arg(long)]
    pub class: String,

    /// Job arguments as a JSON object.
    #[arg(long)]
    pub args: Option<String>,

    /// Source id (required for pools).
    #[arg(long)]
    pub source_id: Option<String>,

    /// Display name; defaults to the class.
    #[arg(long)]
    pub name: Option<String>,

    /// Unique id; duplicates are rejected or deferred.
    #[arg(long)]
    pub unique: Option<String>,

    /// Defer duplicates instead of rejecting them, re-enqueueing after this many seconds.
    #[arg(long, requires = "unique")]
    pub deferrable_by: Option<u64>,

    /// Delay before the job is enqueued, in seconds.
    #[arg(long)]
    pub delay: Option<u64>,
}

/// Arguments for the `plan` command.
#[derive(clap::Args, Debug)]
pub struct PlanArgs {
    #[command(subcommand)]
    pub command: PlanSubcommand,
}

/// Planned job subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum PlanSubcommand {
    /// Create a recurring job.
    Add(PlanAddArgs),
    /// List every plan.
    List,
    /// Show one plan as JSON.
    Show {
        /// Plan id.
        id: String,
    },
    /// Delete a plan.
    Remove {
        /// Plan id.
        id: String,
    },
}

/// Arguments for `plan add`.
#[derive(clap::Args, Debug)]
pub struct PlanAddArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Job class.
    #[arg(long)]
    pub class: String,

    /// Job arguments as a JSON object.
    #[arg(long)]
    pub args: Option<String>,

    /// Source id (required for pools).
    #[arg(long)]
    pub source_id: Option<String>,

    /// ISO-8601 recurrence interval, e.g. PT1H or P1M.
    #[arg(long)]
    pub every: String,

    /// First run as unix seconds; defaults to now.
    #[arg(long)]
    pub start: Option<i64>,
}

/// Arguments for the `rebalance` command.
#[derive(clap::Args, Debug)]
pub struct RebalanceArgs {
    /// Batch pool to resize.
    #[arg(long)]
    pub pool: String,

    /// Number of live units.
    #[arg(long)]
    pub units: u32,

    /// Workers each unit should run.
    #[arg(long, default_value = "1")]
    pub workers_per_unit: u32,
}

/// Arguments for the `recover` command.
#[derive(clap::Args, Debug)]
pub struct RecoverArgs {
    /// Worker id (`node~pool~code~pid`).
    #[arg(long)]
    pub worker: String,
}

/// Arguments for the `reconcile` command.
#[derive(clap::Args, Debug)]
pub struct ReconcileArgs {
    /// YAML layout of this node's pools and queues.
    #[arg(long)]
    pub layout: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI application.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli).await
}

/// Run the CLI application with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await?,
        Commands::Allocator(args) => run_allocator_command(args).await?,
        Commands::Scheduler => run_scheduler_command().await?,
        Commands::Enqueue(args) => run_enqueue_command(args).await?,
        Commands::Plan(args) => run_plan_command(args).await?,
        Commands::Rebalance(args) => run_rebalance_command(args).await?,
        Commands::Recover(args) => run_recover_command(args).await?,
        Commands::Reconcile(args) => run_reconcile_command(args).await?,
        Commands::Metrics => run_metrics_command().await?,
    }
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

fn load_config() -> anyhow::Result<EngineConfig> {
    EngineConfig::from_env().context("Invalid engine configuration")
}

async fn connect(config: &EngineConfig) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
    Ok(Arc::new(store))
}

/// Shutdown channel fired on Ctrl-C. Keep the returned sender alive for as
/// long as receivers are in use.
fn shutdown_channel() -> broadcast::Sender<()> {
    let (tx, _) = broadcast::channel(1);
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = signal_tx.send(());
        }
    });
    tx
}

fn parse_args_object(raw: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--args is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {}", other),
    }
}

fn build_job(
    class: &str,
    args: Option<&str>,
    source_id: Option<&str>,
    name: Option<&str>,
) -> anyhow::Result<Job> {
    let mut job = Job::new(class).with_args(parse_args_object(args)?);
    if let Some(source_id) = source_id {
        job = job.with_source_id(source_id);
    }
    if let Some(name) = name {
        job = job.with_name(name);
    }
    Ok(job)
}

// ============================================================================
// Long-running processes
// ============================================================================

async fn build_worker(
    config: &EngineConfig,
    args: &WorkerArgs,
    index: u32,
) -> anyhow::Result<WorkerLoop> {
    // Blocking pops hold the connection, so every worker gets its own.
    let store = connect(config).await?;

    let (image, source, strategy): (WorkerImage, Box<dyn JobSource>, Box<dyn ReservationStrategy>) =
        match (&args.queue, &args.pool, args.unit) {
            (Some(queue), _, _) => {
                let image = WorkerImage::current(&config.node_id, queue, format!("w{index}"))?;
                let source = BufferedSource::new(store.clone(), queue, image.buffer_key());
                (image, Box::new(source), queue_strategy(config, args.sleep))
            }
            (None, Some(pool), Some(unit)) => {
                let image = WorkerImage::current(&config.node_id, pool, unit_code(unit))?;
                let source = BatchPoolSource::new(store.clone(), pool, unit, image.buffer_key());
                let waits = config.terminate_after_waits;
                let timeout = config.reserve_timeout;
                let strategy: Box<dyn ReservationStrategy> = if args.sleep {
                    Box::new(TerminateDecorator::new(SleepStrategy::new(timeout), waits))
                } else {
                    Box::new(TerminateDecorator::new(BlockingStrategy::new(timeout), waits))
                };
                (image, Box::new(source), strategy)
            }
            _ => bail!("worker needs --queue, or --pool with --unit"),
        };

    let executor: Arc<dyn JobExecutor> = Arc::new(CommandExecutor::new(&args.program_dir));

    Ok(WorkerLoop::new(image, store, source, strategy, executor)
        .with_max_fails(config.max_fails)
        .with_stale_lock_after(config.stale_lock_after)
        .with_job_timeout(config.job_timeout))
}

fn queue_strategy(config: &EngineConfig, sleep: bool) -> Box<dyn ReservationStrategy> {
    if sleep {
        Box::new(SleepStrategy::new(config.reserve_timeout))
    } else {
        Box::new(BlockingStrategy::new(config.reserve_timeout))
    }
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    init_metrics()?;

    if let Some(queue) = &args.queue {
        let store = connect(&config).await?;
        if store.sadd(keys::QUEUE_REGISTRY, queue).await? {
            info!(queue = %queue, "Queue registered");
        }
    }

    let shutdown = shutdown_channel();
    let count = if args.queue.is_some() { args.workers.max(1) } else { 1 };
    let mut workers = Vec::with_capacity(count as usize);
    for index in 0..count {
        workers.push(build_worker(&config, &args, index).await?);
    }

    let runs = workers.iter_mut().map(|worker| {
        let rx = shutdown.subscribe();
        async move {
            let reason = worker.run(rx).await?;
            info!(worker = %worker.image(), reason = ?reason, "Worker exited");
            Ok::<StopReason, crate::error::WorkerError>(reason)
        }
    });
    futures::future::try_join_all(runs)
        .await
        .context("Worker stopped on an invariant violation")?;
    Ok(())
}

async fn run_allocator_command(args: AllocatorArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    init_metrics()?;
    let store = connect(&config).await?;

    let image = AllocatorImage::current(&config.node_id, &args.pool)?;
    let registry = ProcessRegistry::new(store.clone());
    registry.register(&image).await?;

    let shutdown = shutdown_channel();
    BatchAllocator::new(store, &args.pool)
        .run(shutdown.subscribe(), Duration::from_millis(args.poll_ms))
        .await;

    registry.unregister(&image).await?;
    Ok(())
}

async fn run_scheduler_command() -> anyhow::Result<()> {
    let config = load_config()?;
    init_metrics()?;
    let store = connect(&config).await?;

    let image = SchedulerImage::current(&config.node_id)?;
    let registry = ProcessRegistry::new(store.clone());
    registry.register(&image).await?;

    let shutdown = shutdown_channel();
    let result = SchedulerLoop::new(store)
        .with_tick(config.scheduler_tick)
        .run(shutdown.subscribe())
        .await;

    registry.unregister(&image).await?;
    result.context("Scheduler stopped on an invariant violation")
}

// ============================================================================
// Management commands
// ============================================================================

async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    let store = connect(&config).await?;

    let mut job = build_job(
        &args.class,
        args.args.as_deref(),
        args.source_id.as_deref(),
        args.name.as_deref(),
    )?;
    if let Some(uid) = &args.unique {
        job = job.with_unique(match args.deferrable_by {
            Some(secs) => UniqueDescriptor::deferrable(uid, secs),
            None => UniqueDescriptor::new(uid),
        });
    }
    let dest = args.target.destination();

    match args.delay {
        Some(secs) if secs > 0 => {
            let at = DelayedScheduler::new(store)
                .schedule_in(Duration::from_secs(secs), &dest, job)
                .await?;
            println!("Scheduled for {} at {}", dest, at);
        }
        _ => {
            let id = Producer::new(store).enqueue(&dest, job).await?;
            println!("{}", id);
        }
    }
    Ok(())
}

async fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    let planner = PlannedScheduler::new(connect(&config).await?);

    match args.command {
        PlanSubcommand::Add(args) => {
            let interval: RecurrenceInterval = args.every.parse()?;
            let job = build_job(
                &args.class,
                args.args.as_deref(),
                args.source_id.as_deref(),
                None,
            )?;
            let start = args.start.unwrap_or_else(|| now_epoch() as i64);
            let plan =
                PlannedJob::new(job, start, &interval).with_target(args.target.destination());
            planner.schedule(&plan).await?;
            println!("{}", plan.id);
        }
        PlanSubcommand::List => {
            let plans = planner.list().await?;
            if plans.is_empty() {
                println!("No planned jobs.");
            }
            for plan in plans {
                println!(
                    "{}  next={}  every={}  {} -> {}",
                    plan.id,
                    plan.next_run,
                    plan.recurrence_interval,
                    plan.job.class,
                    plan.target
                );
            }
        }
        PlanSubcommand::Show { id } => match planner.get(&id).await? {
            Some(plan) => println!("{}", serde_json::to_string_pretty(&plan)?),
            None => bail!("No planned job with id {}", id),
        },
        PlanSubcommand::Remove { id } => {
            planner.remove(&id).await?;
            println!("Removed {}", id);
        }
    }
    Ok(())
}

async fn run_rebalance_command(args: RebalanceArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    let store = connect(&config).await?;

    let report = PoolMaintainer::new(store, &args.pool)
        .rebalance(args.units, args.workers_per_unit)
        .await?;

    println!("Pool {}: {} units", args.pool, report.desired.len());
    for (unit, workers) in &report.desired {
        println!("  unit {}: {} workers", unit, workers);
    }
    if !report.retired.is_empty() {
        println!("  retired: {:?}", report.retired);
    }
    println!("  batches migrated: {}", report.migrated);
    Ok(())
}

async fn run_recover_command(args: RecoverArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    let store = connect(&config).await?;
    let image: WorkerImage = args.worker.parse()?;

    let recovered = recover_buffer(store.clone(), &image).await?;
    ProcessRegistry::new(store).unregister_worker(&image).await?;
    println!("Recovered {} jobs from {}", recovered, image);
    Ok(())
}

async fn run_reconcile_command(args: ReconcileArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    let layout = PoolLayout::load(&args.layout)?;
    let store = connect(&config).await?;

    let maintainer = Maintainer::new(store, &config.node_id, Arc::new(LocalProcessProbe));
    let report = maintainer.reconcile(&layout).await?;

    for id in &report.culled {
        println!("culled {}", id);
    }
    for queue in &report.deregistered_queues {
        println!("deregistered queue {}", queue);
    }
    if report.recovered > 0 {
        println!("recovered {} orphaned jobs", report.recovered);
    }
    for line in &report.capacity {
        println!(
            "{:?} {}{}: {}/{}",
            line.kind,
            line.pool,
            line.code.as_deref().map(|c| format!("/{c}")).unwrap_or_default(),
            line.running,
            line.desired
        );
    }
    let short = report.shortfalls().count();
    if short > 0 {
        warn!(slots = short, "Node is below its desired capacity");
    }
    Ok(())
}

async fn run_metrics_command() -> anyhow::Result<()> {
    init_metrics()?;

    // Queue depth is read live when a store is configured.
    match EngineConfig::from_env() {
        Ok(config) => {
            let store = connect(&config).await?;
            let metrics = MetricsCollector::new();
            for queue in store.smembers(keys::QUEUE_REGISTRY).await? {
                let depth = store.llen(&keys::queue(&queue)).await?;
                metrics.set_queue_depth(&queue, depth);
            }
        }
        Err(e) => warn!(error = %e, "No store configured, skipping queue depth"),
    }

    print!("{}", export_metrics());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_worker_queue() {
        let cli = Cli::try_parse_from([
            "jobforge", "worker", "--queue", "mail", "-w", "3", "--program-dir", "/opt/jobs",
        ])
        .unwrap();
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.queue.as_deref(), Some("mail"));
                assert_eq!(args.workers, 3);
                assert!(!args.sleep);
                assert_eq!(args.program_dir, PathBuf::from("/opt/jobs"));
            }
            _ => panic!("expected worker command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_pool_worker_requires_unit() {
        let base = ["jobforge", "worker", "--program-dir", "/opt/jobs", "--pool", "reports"];
        assert!(Cli::try_parse_from(base).is_err());
        assert!(Cli::try_parse_from(base.iter().chain(&["--unit", "2"])).is_ok());
    }

    #[test]
    fn test_cli_worker_requires_program_dir() {
        assert!(Cli::try_parse_from(["jobforge", "worker", "--queue", "mail"]).is_err());
    }

    #[test]
    fn test_cli_rejects_queue_and_pool() {
        let parsed = Cli::try_parse_from([
            "jobforge", "enqueue", "--queue", "a", "--pool", "b", "--class", "Sync",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_target_destination() {
        let target = TargetArgs {
            queue: None,
            pool: Some("reports".to_string()),
            suffix: "eu".to_string(),
        };
        assert_eq!(target.destination(), Destination::pool("reports", "eu"));

        let target = TargetArgs {
            queue: None,
            pool: None,
            suffix: String::new(),
        };
        assert_eq!(target.destination(), Destination::default());
    }

    #[test]
    fn test_parse_args_object() {
        assert!(parse_args_object(None).unwrap().is_empty());
        let map = parse_args_object(Some(r#"{"id": 7}"#)).unwrap();
        assert_eq!(map["id"], 7);
        assert!(parse_args_object(Some("[1, 2]")).is_err());
        assert!(parse_args_object(Some("{")).is_err());
    }

    #[test]
    fn test_build_job_sets_optional_fields() {
        let job = build_job("Sync", None, Some("acct-1"), Some("nightly")).unwrap();
        assert_eq!(job.class, "Sync");
        assert_eq!(job.source_id.as_deref(), Some("acct-1"));
        assert_eq!(job.display_name(), "nightly");
    }
}
