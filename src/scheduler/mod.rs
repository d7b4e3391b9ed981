//! Delayed and recurring job scheduling.
//!
//! - **Job / RecurringJob**: serializable work descriptions
//! - **JobStore**: due-set, working set and terminal maps (Redis or memory)
//! - **Scheduler**: tick loop that promotes due jobs and runs handlers
//!
//! # Architecture
//!
//! ```text
//!   add_job ──────────────┐          ┌──────────────┐
//!                         ▼          │  recurring   │
//!                  ┌─────────────┐   │ definitions  │
//!                  │   due-set   │◄──┴──────────────┘
//!                  │ (by run-at) │        expand
//!                  └──────┬──────┘
//!                         │ tick: run-at <= now
//!                  ┌──────▼──────┐
//!                  │ working set │── handler (timeout, bounded pool)
//!                  └──────┬──────┘
//!            ┌────────────┼─────────────┐
//!            ▼            ▼             ▼
//!       completed     due-set        failed
//!                   (retry, backoff)  (budget spent)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reelcast::scheduler::{Job, MemoryJobStore, Scheduler, SchedulerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let scheduler = Arc::new(Scheduler::new(
//!     Arc::new(MemoryJobStore::new()),
//!     SchedulerConfig::default(),
//! ));
//! scheduler.register_handler("publish", publish_handler);
//! scheduler.add_job(Job::new("publish", payload)).await?;
//!
//! let cancel = CancellationToken::new();
//! tokio::spawn(Arc::clone(&scheduler).process_jobs(cancel.clone()));
//! ```

pub mod engine;
pub mod handler;
pub mod job;
pub mod redis_store;
pub mod store;

pub use engine::{Scheduler, SchedulerConfig, SchedulerError, TickReport};
pub use handler::{FnHandler, JobError, JobHandler};
pub use job::{Frequency, Job, JobStatus, RecurringJob, RecurringRule, DEFAULT_MAX_RETRIES};
pub use redis_store::RedisJobStore;
pub use store::{JobStats, JobStore, JobStoreError, MemoryJobStore};
