//! Metrics module for Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use reelcast::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("publish", "completed", 1.4);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, BATCH_VIDEOS_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    PUBLISH_TOTAL, QUEUE_DEPTH, REGISTRY, STAGE_DURATION,
};
