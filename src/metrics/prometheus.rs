//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by reelcast and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all reelcast metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Scheduler job executions, labeled by handler and outcome
/// (completed, retried, failed).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scheduler job execution duration in seconds, labeled by handler.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of entries in a queue or job collection, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of scheduler jobs currently executing.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Batch videos settled, labeled by final status.
pub static BATCH_VIDEOS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Generation stage duration in seconds, labeled by stage and status.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Platform upload attempts, labeled by platform and status.
pub static PUBLISH_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of batch workers currently processing a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("reelcast_jobs_total", "Scheduler job executions"),
        &["handler", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "reelcast_job_duration_seconds",
            "Scheduler job execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]),
        &["handler"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("reelcast_queue_depth", "Number of entries in a queue"),
        &["queue_name"],
    )?;

    let jobs_in_progress = Gauge::new(
        "reelcast_jobs_in_progress",
        "Number of scheduler jobs currently executing",
    )?;

    let batch_videos_total = CounterVec::new(
        Opts::new("reelcast_batch_videos_total", "Batch videos settled"),
        &["status"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "reelcast_stage_duration_seconds",
            "Generation stage duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 180.0, 600.0]),
        &["stage", "status"],
    )?;

    let publish_total = CounterVec::new(
        Opts::new("reelcast_publish_total", "Platform upload attempts"),
        &["platform", "status"],
    )?;

    let active_workers = Gauge::new(
        "reelcast_active_workers",
        "Number of batch workers processing a task",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(batch_videos_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(publish_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // A second call finds the cells already set and keeps the first registry.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = BATCH_VIDEOS_TOTAL.set(batch_videos_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = PUBLISH_TOTAL.set(publish_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
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
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&["publish", "completed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("reelcast_jobs_total"));
    }
}
