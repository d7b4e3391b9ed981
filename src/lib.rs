//! reelcast: job scheduling, batch video generation and social publishing.
//!
//! - [`scheduler`]: delayed, retried and recurring jobs over a job store
//! - [`batch`]: multi-stage video generation driven by a task queue
//! - [`publisher`]: scheduled multi-platform posts on top of the scheduler
//!
//! [`storage`] holds the repositories both services persist through and
//! [`queue`] the reliable task queue with its worker pool.

pub mod batch;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod outcome;
pub mod publisher;
pub mod queue;
pub mod scheduler;
pub mod storage;

pub use config::{AppConfig, ConfigError};
pub use error::{BatchError, PlatformError, PublishError, StageError, StoreError};
pub use outcome::Outcome;
