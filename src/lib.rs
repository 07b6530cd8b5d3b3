//! jobforge: distributed job-queue engine over a shared key-value store.
//!
//! Producers enqueue jobs onto FIFO queues or batch pools; workers reserve,
//! execute and settle them. Unique jobs are guarded by per-id locks, and a
//! scheduler fires delayed and recurring jobs.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod job;
pub mod maintainer;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod unique;
pub mod worker;

// Re-export commonly used types
pub use config::{EngineConfig, PoolLayout};
pub use error::{
    ConfigError, EnqueueError, MaintainerError, PoolError, SchedulerError, StoreError,
    UniqueError, WorkerError,
};
pub use job::{Destination, Job, PlannedJob, QueuedJob, UniqueDescriptor};
pub use queue::Producer;
pub use store::{KeyValueStore, MemoryStore, RedisStore};
pub use worker::WorkerLoop;
