//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs handed to a worker, labeled by source kind.
pub static JOBS_RESERVED: OnceLock<CounterVec> = OnceLock::new();

/// Execution outcomes, labeled by outcome (success/retry/reschedule/fail,
/// deferred/discarded).
pub static JOB_OUTCOMES: OnceLock<CounterVec> = OnceLock::new();

/// Time between enqueue and reservation.
pub static QUEUE_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Batch allocation attempts, labeled by pool and result.
pub static BATCHES_ASSIGNED: OnceLock<CounterVec> = OnceLock::new();

/// Scheduled entries moved into queues, labeled by scheduler kind.
pub static SCHEDULER_FIRED: OnceLock<CounterVec> = OnceLock::new();

/// Current length of each registered queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of worker loops running in this process.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_reserved = CounterVec::new(
        Opts::new("jobforge_jobs_reserved_total", "Jobs reserved by workers"),
        &["source"],
    )?;

    let job_outcomes = CounterVec::new(
        Opts::new("jobforge_job_outcomes_total", "Job execution outcomes"),
        &["outcome"],
    )?;

    let queue_latency = Histogram::with_opts(
        HistogramOpts::new(
            "jobforge_queue_latency_seconds",
            "Seconds between enqueue and reservation",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0, 3600.0]),
    )?;

    let batches_assigned = CounterVec::new(
        Opts::new(
            "jobforge_batches_assigned_total",
            "Batch allocation attempts",
        ),
        &["pool", "result"],
    )?;

    let scheduler_fired = CounterVec::new(
        Opts::new(
            "jobforge_scheduler_fired_total",
            "Scheduled entries moved into queues",
        ),
        &["kind"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("jobforge_queue_depth", "Number of jobs in queue"),
        &["queue"],
    )?;

    let active_workers = Gauge::new("jobforge_active_workers", "Number of active workers")?;

    registry.register(Box::new(jobs_reserved.clone()))?;
    registry.register(Box::new(job_outcomes.clone()))?;
    registry.register(Box::new(queue_latency.clone()))?;
    registry.register(Box::new(batches_assigned.clone()))?;
    registry.register(Box::new(scheduler_fired.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set statics mean metrics were initialized before.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_RESERVED.set(jobs_reserved);
    let _ = JOB_OUTCOMES.set(job_outcomes);
    let _ = QUEUE_LATENCY.set(queue_latency);
    let _ = BATCHES_ASSIGNED.set(batches_assigned);
    let _ = SCHEDULER_FIRED.set(scheduler_fired);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when metrics were never initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics();
        assert!(first.is_ok() || REGISTRY.get().is_some());
        let _ = init_metrics();
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        let _ = init_metrics();
        if let Some(counter) = JOB_OUTCOMES.get() {
            counter.with_label_values(&["success"]).inc();
        }
        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("jobforge_job_outcomes_total"));
    }
}
