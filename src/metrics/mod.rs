//! Metrics module for Prometheus-based monitoring.
//!
//! Covers reservations, execution outcomes, queue latency, batch allocation
//! and scheduler activity.
//!
//! # Example
//!
//! ```ignore
//! use jobforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_outcome("success");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, BATCHES_ASSIGNED, JOBS_RESERVED, JOB_OUTCOMES, QUEUE_DEPTH, QUEUE_LATENCY,
    REGISTRY, SCHEDULER_FIRED,
};
