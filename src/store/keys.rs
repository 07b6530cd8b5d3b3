//! Store key layout.
//!
//! All processes of a deployment must agree on these names.

/// Registry of known FIFO queue names.
pub const QUEUE_REGISTRY: &str = "queues";
/// Registry of live worker images.
pub const WORKER_REGISTRY: &str = "workers";
/// Registry of live allocator images.
pub const ALLOCATOR_REGISTRY: &str = "allocators";
/// Registry of live scheduler images.
pub const SCHEDULER_REGISTRY: &str = "schedulers";
/// Sorted set of delayed-bucket timestamps.
pub const DELAYED_SCHEDULE: &str = "delayed_queue_schedule";
/// Sorted set of plan-bucket timestamps.
pub const PLAN_SCHEDULE: &str = "plan_schedule";
/// Set of every stored plan id.
pub const PLAN_INDEX: &str = "plans";
/// Dead letter list for permanently failed jobs.
pub const FAILED_JOBS: &str = "failed_jobs";
/// Payloads recovered from buffers of dead workers.
pub const ORPHANED_JOBS: &str = "orphaned_jobs";

pub fn unique_state(uid: &str) -> String {
    format!("unique:{uid}:state")
}

pub fn unique_deferred(uid: &str) -> String {
    format!("unique:{uid}:deferred")
}

pub fn queue(name: &str) -> String {
    format!("queue:{name}")
}

/// Producer scratch list holding one staged payload.
pub fn staging(job_id: &str) -> String {
    format!("staging:{job_id}")
}

/// Reliable-pop buffer owned by a single worker.
pub fn worker_buffer(image: &str) -> String {
    format!("worker:{image}:buffer")
}

/// Hash describing the job a worker is currently executing.
pub fn worker_runtime(image: &str) -> String {
    format!("worker:{image}:runtime")
}

pub fn unit_queues(pool: &str) -> String {
    format!("pool:{pool}:unit_queues")
}

pub fn unit_queue(pool: &str, unit: u32) -> String {
    format!("pool:{pool}:{unit}:queues")
}

/// Extracts the unit id from a unit-queue key of `pool`.
pub fn parse_unit_queue(pool: &str, key: &str) -> Option<u32> {
    key.strip_prefix(&format!("pool:{pool}:"))?
        .strip_suffix(":queues")?
        .parse()
        .ok()
}

pub fn pool_sources(pool: &str) -> String {
    format!("pool:{pool}:sources")
}

pub fn pool_backlog(pool: &str, source_id: &str) -> String {
    format!("pool:{pool}:backlog:{source_id}")
}

pub fn pool_committed(pool: &str) -> String {
    format!("pool:{pool}:committed")
}

pub fn pool_incoming(pool: &str) -> String {
    format!("pool:{pool}:incoming")
}

pub fn pool_batch(pool: &str, batch_id: &str) -> String {
    format!("pool:{pool}:batch:{batch_id}")
}

pub fn pool_batches(pool: &str) -> String {
    format!("pool:{pool}:batches")
}

pub fn delayed_bucket(ts: i64) -> String {
    format!("delayed:{ts}")
}

pub fn plan(plan_id: &str) -> String {
    format!("plan:{plan_id}")
}

pub fn plan_bucket(ts: i64) -> String {
    format!("plan_schedule:{ts}")
}
