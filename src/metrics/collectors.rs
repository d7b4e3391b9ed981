//! High-level recording interface over the Prometheus statics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! and tests can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, BATCH_VIDEOS_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    PUBLISH_TOTAL, QUEUE_DEPTH, STAGE_DURATION,
};

/// Metrics collector for recording reelcast operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one scheduler job attempt.
    ///
    /// # Arguments
    ///
    /// * `handler` - Handler name the job was addressed to
    /// * `status` - "completed", "retried" or "failed"
    /// * `duration_secs` - Attempt duration in seconds
    pub fn record_job(&self, handler: &str, status: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[handler, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[handler])
                .observe(duration_secs);
        }

        tracing::trace!(
            handler = handler,
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    pub fn job_started(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    pub fn job_finished(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    /// Set the current depth of a named queue or collection.
    pub fn set_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }
    }

    /// Record a batch video reaching a final status.
    pub fn record_batch_video(&self, status: &str) {
        if let Some(videos) = BATCH_VIDEOS_TOTAL.get() {
            videos.with_label_values(&[status]).inc();
        }
    }

    /// Record one generation stage call.
    pub fn record_stage(&self, stage: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "failure" };
        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&[stage, status])
                .observe(duration_secs);
        }
    }

    /// Record one platform upload attempt.
    pub fn record_publish(&self, platform: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        if let Some(publish_total) = PUBLISH_TOTAL.get() {
            publish_total.with_label_values(&[platform, status]).inc();
        }
    }

    pub fn worker_busy(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn worker_idle(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}
