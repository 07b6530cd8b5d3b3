//! Recording facade over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, BATCHES_ASSIGNED, JOBS_RESERVED, JOB_OUTCOMES, QUEUE_DEPTH, QUEUE_LATENCY,
    SCHEDULER_FIRED,
};

/// Metrics collector for jobforge operations.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a reserved job and its time spent queued.
    pub fn record_reserved(&self, source: &str, latency_secs: f64) {
        if let Some(reserved) = JOBS_RESERVED.get() {
            reserved.with_label_values(&[source]).inc();
        }
        if let Some(latency) = QUEUE_LATENCY.get() {
            latency.observe(latency_secs);
        }

        tracing::trace!(source = source, latency_secs = latency_secs, "Recorded reservation");
    }

    /// Record the outcome of one execution attempt.
    pub fn record_outcome(&self, outcome: &str) {
        if let Some(outcomes) = JOB_OUTCOMES.get() {
            outcomes.with_label_values(&[outcome]).inc();
        }
    }

    /// Record a batch allocation attempt.
    ///
    /// `result` is one of `assigned`, `backlogged`, `stale`.
    pub fn record_batch(&self, pool: &str, result: &str) {
        if let Some(batches) = BATCHES_ASSIGNED.get() {
            batches.with_label_values(&[pool, result]).inc();
        }
    }

    /// Record an entry moved by a scheduler (`delayed` or `planned`).
    pub fn record_scheduler_fired(&self, kind: &str) {
        if let Some(fired) = SCHEDULER_FIRED.get() {
            fired.with_label_values(&[kind]).inc();
        }
    }

    /// Update the queue depth for a specific queue.
    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }
    }

    pub fn worker_started(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    pub fn worker_stopped(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }
}
