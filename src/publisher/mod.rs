//! Scheduled publishing of videos to social platforms.
//!
//! A [`ScheduledPost`] targets one or more accounts. Each target (a leg) is
//! published by its own `publish` job on the [`crate::scheduler::Scheduler`],
//! so legs retry and fail independently:
//!
//! ```text
//!  schedule_publish ──► publish job per leg ──► PlatformUploader
//!         │                                          │
//!         └── recurring rule ──► republish_post      ▼
//!                                 (next occurrence)  leg published / failed
//!                                                     │
//!                                          post settles once all legs have
//! ```

pub mod format;
pub mod model;
pub mod platform;
pub mod service;

pub use format::{format_for_platform, truncate_chars};
pub use model::{
    LegStatus, Platform, PlatformPost, PostStatus, Privacy, PublishJobPayload, RepublishPayload,
    ScheduledPost, SocialAccount,
};
pub use platform::{
    HttpPlatformClient, PlatformRegistry, PlatformUploader, PostAnalytics, Trend, UploadRequest,
    UploadResult,
};
pub use service::{LegAnalytics, LegOutcome, Publisher, PUBLISH_JOB, REPUBLISH_JOB};
