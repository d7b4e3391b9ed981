//! Publishing of scheduled posts through the scheduler.
//!
//! Each leg (target account) of a post becomes one `publish` job. Leg
//! outcomes are folded back into the post, which settles once every leg
//! has.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::metrics::MetricsCollector;
use crate::scheduler::{Job, JobError, JobHandler, Scheduler};
use crate::storage::{AccountRepository, PostRepository};

use super::format::format_for_platform;
use super::model::{
    LegStatus, Platform, PlatformPost, PostStatus, PublishJobPayload, RepublishPayload, ScheduledPost,
    SocialAccount,
};
use super::platform::{PlatformRegistry, PostAnalytics, UploadRequest};

/// Job handler name for single-leg publish jobs.
pub const PUBLISH_JOB: &str = "publish";

/// Job handler name for occurrences of a recurring post.
pub const REPUBLISH_JOB: &str = "republish_post";

/// What a publish attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegOutcome {
    Published { platform_post_id: String },
    /// The post was cancelled or the leg had already been published.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegAnalytics {
    pub account_id: String,
    pub platform: Platform,
    pub platform_post_id: String,
    pub analytics: PostAnalytics,
}

pub struct Publisher {
    posts: Arc<dyn PostRepository>,
    accounts: Arc<dyn AccountRepository>,
    registry: PlatformRegistry,
    scheduler: Arc<Scheduler>,
    metrics: MetricsCollector,
}

impl Publisher {
    pub fn new(
        posts: Arc<dyn PostRepository>,
        accounts: Arc<dyn AccountRepository>,
        registry: PlatformRegistry,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            posts,
            accounts,
            registry,
            scheduler,
            metrics: MetricsCollector::new(),
        }
    }

    /// Registers the `publish` and `republish_post` handlers on the scheduler.
    pub fn register(self: &Arc<Self>) {
        self.scheduler.register_handler(
            PUBLISH_JOB,
            Arc::new(PublishJobHandler {
                publisher: Arc::downgrade(self),
            }),
        );
        self.scheduler.register_handler(
            REPUBLISH_JOB,
            Arc::new(RepublishJobHandler {
                publisher: Arc::downgrade(self),
            }),
        );
    }

    fn now(&self) -> DateTime<Utc> {
        self.scheduler.now()
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    async fn load_post(&self, post_id: Uuid) -> Result<ScheduledPost, PublishError> {
        self.posts
            .get_post(post_id)
            .await?
            .ok_or(PublishError::PostNotFound(post_id))
    }

    async fn load_account(&self, account_id: &str) -> Result<SocialAccount, PublishError> {
        self.accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| PublishError::AccountNotFound(account_id.to_string()))
    }

    async fn check_leg(&self, user_id: &str, leg: &PlatformPost) -> Result<(), PublishError> {
        let account = self.load_account(&leg.account_id).await?;
        if account.user_id != user_id {
            return Err(PublishError::Unauthorized {
                account_id: account.id,
                user_id: user_id.to_string(),
            });
        }
        if account.platform != leg.platform {
            return Err(PublishError::Validation(format!(
                "account '{}' is a {} account, not {}",
                account.id, account.platform, leg.platform
            )));
        }
        self.registry.get(leg.platform)?;
        Ok(())
    }

    /// Validates and persists a post, then schedules one job per leg at the
    /// post's scheduled time.
    pub async fn schedule_publish(
        &self,
        mut post: ScheduledPost,
    ) -> Result<ScheduledPost, PublishError> {
        post.validate()?;
        for leg in &post.platforms {
            self.check_leg(&post.user_id, leg).await?;
        }

        let now = self.now();
        post.status = PostStatus::Scheduled;
        post.outcome = None;
        post.error = None;
        post.created_at = now;
        post.updated_at = now;
        for leg in &mut post.platforms {
            leg.reset();
        }
        self.posts.save_post(&post).await?;

        let account_ids: Vec<String> = post.platforms.iter().map(|l| l.account_id.clone()).collect();
        let post = self
            .schedule_legs(post.id, &account_ids, post.scheduled_at)
            .await?;

        if let Some(rule) = post.recurring {
            let payload = serde_json::to_value(RepublishPayload { post_id: post.id })
                .map_err(|e| PublishError::Validation(e.to_string()))?;
            self.scheduler
                .add_recurring_job_from(
                    post.recurring_name(),
                    REPUBLISH_JOB,
                    payload,
                    rule,
                    post.scheduled_at,
                )
                .await?;
        }

        info!(
            post_id = %post.id,
            user_id = %post.user_id,
            legs = post.platforms.len(),
            scheduled_at = %post.scheduled_at,
            timezone = %post.timezone,
            "Post scheduled"
        );
        Ok(post)
    }

    /// Adds a publish job for each listed leg. The leg records the job id
    /// before the job is stored, so only the latest job of a leg is current.
    async fn schedule_legs(
        &self,
        post_id: Uuid,
        account_ids: &[String],
        run_at: DateTime<Utc>,
    ) -> Result<ScheduledPost, PublishError> {
        let mut post = self.load_post(post_id).await?;
        for account_id in account_ids {
            let payload = serde_json::to_value(PublishJobPayload {
                post_id,
                account_id: account_id.clone(),
            })
            .map_err(|e| PublishError::Validation(e.to_string()))?;
            let job = Job::new(PUBLISH_JOB, payload).with_run_at(run_at);
            let job_id = job.id;

            let leg_account = account_id.clone();
            post = self
                .posts
                .update_post(post_id, &move |p: &mut ScheduledPost| {
                    p.leg_mut(&leg_account)?.job_id = Some(job_id);
                    Ok(())
                })
                .await?;
            self.scheduler.add_job(job).await?;
        }
        Ok(post)
    }

    /// Publishes every unpublished leg right away, outside the scheduler.
    /// Failures are final for this call.
    pub async fn publish_now(&self, post_id: Uuid) -> Result<ScheduledPost, PublishError> {
        let now = self.now();
        let post = self
            .posts
            .update_post(post_id, &move |p: &mut ScheduledPost| p.begin_publishing(now))
            .await?;

        let pending: Vec<String> = post
            .platforms
            .iter()
            .filter(|leg| leg.status != LegStatus::Published)
            .map(|leg| leg.account_id.clone())
            .collect();

        let attempts = pending.iter().map(|account_id| async move {
            (account_id, self.publish_leg(post_id, account_id, None).await)
        });
        for (account_id, result) in join_all(attempts).await {
            if let Err(e) = result {
                warn!(post_id = %post_id, account_id = %account_id, error = %e, "Immediate publish failed");
                self.record_leg_failure(post_id, account_id, &e.to_string())
                    .await?;
            }
        }
        self.load_post(post_id).await
    }

    /// One upload attempt for one leg. With `job_id` set, the attempt is
    /// skipped unless that job is still the leg's current one.
    pub async fn publish_leg(
        &self,
        post_id: Uuid,
        account_id: &str,
        job_id: Option<Uuid>,
    ) -> Result<LegOutcome, PublishError> {
        let post = self.load_post(post_id).await?;
        if post.status.is_terminal() {
            info!(post_id = %post_id, status = %post.status, "Post already settled, skipping publish");
            return Ok(LegOutcome::Skipped);
        }
        let leg = post
            .leg(account_id)
            .ok_or_else(|| PublishError::LegNotFound {
                post_id,
                account_id: account_id.to_string(),
            })?
            .clone();
        if leg.status == LegStatus::Published {
            return Ok(LegOutcome::Skipped);
        }
        if job_id.is_some() && leg.job_id != job_id {
            debug!(post_id = %post_id, account_id = %account_id, "Superseded publish job, skipping");
            return Ok(LegOutcome::Skipped);
        }

        let account = self.load_account(account_id).await?;
        let uploader = self.registry.get(leg.platform)?;

        let now = self.now();
        let leg_account = account_id.to_string();
        self.posts
            .update_post(post_id, &move |p: &mut ScheduledPost| {
                p.begin_publishing(now)?;
                p.leg_mut(&leg_account)?.begin();
                Ok(())
            })
            .await?;

        let request = UploadRequest {
            video_path: post.video_path.clone(),
            title: leg.title.clone(),
            description: format_for_platform(&leg.description, leg.platform),
            tags: leg.tags.clone(),
            privacy: leg.privacy,
        };

        match uploader.upload(&account, &request).await {
            Ok(result) => {
                self.metrics.record_publish(leg.platform.as_str(), true);
                let now = self.now();
                let leg_account = account_id.to_string();
                let platform_post_id = result.platform_post_id.clone();
                let post_url = result.post_url.clone();
                let post = self
                    .posts
                    .update_post(post_id, &move |p: &mut ScheduledPost| {
                        p.leg_mut(&leg_account)?.mark_published(
                            platform_post_id.clone(),
                            post_url.clone(),
                            now,
                        );
                        p.recompute_status(now);
                        Ok(())
                    })
                    .await?;
                info!(
                    post_id = %post_id,
                    account_id = %account_id,
                    platform = %leg.platform,
                    platform_post_id = %result.platform_post_id,
                    "Leg published"
                );
                if post.status.is_terminal() {
                    log_settled(&post);
                }
                Ok(LegOutcome::Published {
                    platform_post_id: result.platform_post_id,
                })
            }
            Err(e) => {
                self.metrics.record_publish(leg.platform.as_str(), false);
                let message = e.to_string();
                let leg_account = account_id.to_string();
                self.posts
                    .update_post(post_id, &move |p: &mut ScheduledPost| {
                        let leg = p.leg_mut(&leg_account)?;
                        leg.status = LegStatus::Pending;
                        leg.error = Some(message.clone());
                        Ok(())
                    })
                    .await?;
                Err(PublishError::Platform(e))
            }
        }
    }

    /// Marks a leg failed for good and recomputes the post.
    pub async fn record_leg_failure(
        &self,
        post_id: Uuid,
        account_id: &str,
        reason: &str,
    ) -> Result<ScheduledPost, PublishError> {
        let now = self.now();
        let leg_account = account_id.to_string();
        let message = reason.to_string();
        let post = self
            .posts
            .update_post(post_id, &move |p: &mut ScheduledPost| {
                let leg = p.leg_mut(&leg_account)?;
                if leg.status != LegStatus::Published {
                    leg.mark_failed(message.clone());
                }
                p.recompute_status(now);
                Ok(())
            })
            .await?;
        error!(post_id = %post_id, account_id = %account_id, error = %reason, "Leg failed");
        if post.status.is_terminal() {
            log_settled(&post);
        }
        Ok(post)
    }

    /// `failed -> scheduled`; legs not yet published are scheduled again now.
    pub async fn retry_failed_post(&self, post_id: Uuid) -> Result<ScheduledPost, PublishError> {
        let now = self.now();
        let post = self
            .posts
            .update_post(post_id, &move |p: &mut ScheduledPost| {
                p.reset_for_retry(now).map(|_| ())
            })
            .await?;
        let reopened: Vec<String> = post
            .platforms
            .iter()
            .filter(|leg| leg.status == LegStatus::Pending)
            .map(|leg| leg.account_id.clone())
            .collect();
        info!(post_id = %post_id, legs = reopened.len(), "Retrying failed post");
        self.schedule_legs(post_id, &reopened, now).await
    }

    /// `scheduled -> cancelled`. Pending jobs find the post cancelled and do nothing.
    pub async fn cancel_post(&self, post_id: Uuid) -> Result<ScheduledPost, PublishError> {
        let now = self.now();
        let post = self
            .posts
            .update_post(post_id, &move |p: &mut ScheduledPost| p.cancel(now))
            .await?;
        if post.recurring.is_some() {
            self.scheduler
                .remove_recurring_job(&post.recurring_name())
                .await?;
        }
        info!(post_id = %post_id, "Post cancelled");
        Ok(post)
    }

    /// Upcoming posts of a user (scheduled or publishing), soonest first.
    pub async fn list_queue(&self, user_id: &str) -> Result<Vec<ScheduledPost>, PublishError> {
        let mut posts: Vec<ScheduledPost> = self
            .posts
            .list_posts(user_id)
            .await?
            .into_iter()
            .filter(|p| matches!(p.status, PostStatus::Scheduled | PostStatus::Publishing))
            .collect();
        posts.sort_by_key(|p| p.scheduled_at);
        Ok(posts)
    }

    /// Fetches analytics for every published leg. Legs whose lookup fails
    /// are logged and left out.
    pub async fn collect_analytics(&self, post_id: Uuid) -> Result<Vec<LegAnalytics>, PublishError> {
        let post = self.load_post(post_id).await?;
        let mut collected = Vec::new();
        for leg in post
            .platforms
            .iter()
            .filter(|leg| leg.status == LegStatus::Published)
        {
            let Some(platform_post_id) = leg.platform_post_id.clone() else {
                continue;
            };
            let account = self.load_account(&leg.account_id).await?;
            let uploader = self.registry.get(leg.platform)?;
            match uploader.get_analytics(&account, &platform_post_id).await {
                Ok(analytics) => collected.push(LegAnalytics {
                    account_id: leg.account_id.clone(),
                    platform: leg.platform,
                    platform_post_id,
                    analytics,
                }),
                Err(e) => warn!(
                    post_id = %post_id,
                    account_id = %leg.account_id,
                    error = %e,
                    "Analytics lookup failed"
                ),
            }
        }
        Ok(collected)
    }

    /// Starts the occurrence of a recurring post due at `occurrence`.
    async fn republish(&self, post_id: Uuid, occurrence: DateTime<Utc>) -> Result<(), PublishError> {
        let post = match self.posts.get_post(post_id).await? {
            Some(post) if post.status != PostStatus::Cancelled => post,
            _ => {
                info!(post_id = %post_id, "Recurring post gone or cancelled, removing series");
                self.scheduler
                    .remove_recurring_job(&recurring_name(post_id))
                    .await?;
                return Ok(());
            }
        };

        let now = self.now();
        self.posts
            .update_post(post_id, &move |p: &mut ScheduledPost| {
                p.reset_for_occurrence(occurrence, now)
            })
            .await?;
        let account_ids: Vec<String> = post.platforms.iter().map(|l| l.account_id.clone()).collect();
        self.schedule_legs(post_id, &account_ids, occurrence).await?;
        info!(
            post_id = %post_id,
            occurrence = %occurrence,
            legs = account_ids.len(),
            "Recurring post re-scheduled"
        );
        Ok(())
    }
}

fn recurring_name(post_id: Uuid) -> String {
    format!("post:{}", post_id)
}

fn log_settled(post: &ScheduledPost) {
    info!(
        post_id = %post.id,
        status = %post.status,
        outcome = ?post.outcome,
        "Post settled"
    );
}

fn to_job_error(error: PublishError) -> JobError {
    if error.is_retryable() {
        JobError::failed(error.to_string())
    } else {
        JobError::permanent(error.to_string())
    }
}

struct PublishJobHandler {
    publisher: Weak<Publisher>,
}

#[async_trait]
impl JobHandler for PublishJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let publisher = self
            .publisher
            .upgrade()
            .ok_or_else(|| JobError::permanent("publisher has shut down"))?;
        let payload: PublishJobPayload = job
            .payload_as()
            .map_err(|e| JobError::permanent(format!("invalid publish payload: {}", e)))?;
        publisher
            .publish_leg(payload.post_id, &payload.account_id, Some(job.id))
            .await
            .map(|_| ())
            .map_err(to_job_error)
    }

    async fn on_exhausted(&self, job: &Job, error: &JobError) {
        let (Some(publisher), Ok(payload)) =
            (self.publisher.upgrade(), job.payload_as::<PublishJobPayload>())
        else {
            return;
        };
        if let Err(e) = publisher
            .record_leg_failure(payload.post_id, &payload.account_id, &error.to_string())
            .await
        {
            warn!(job_id = %job.id, error = %e, "Could not record leg failure");
        }
    }
}

struct RepublishJobHandler {
    publisher: Weak<Publisher>,
}

#[async_trait]
impl JobHandler for RepublishJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let publisher = self
            .publisher
            .upgrade()
            .ok_or_else(|| JobError::permanent("publisher has shut down"))?;
        let payload: RepublishPayload = job
            .payload_as()
            .map_err(|e| JobError::permanent(format!("invalid republish payload: {}", e)))?;
        let occurrence = job
            .occurrence
            .or(job.run_at)
            .unwrap_or_else(|| publisher.now());
        publisher
            .republish(payload.post_id, occurrence)
            .await
            .map_err(to_job_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::PlatformError;
    use crate::outcome::Outcome;
    use crate::publisher::platform::{PlatformUploader, Trend, UploadResult};
    use crate::scheduler::{MemoryJobStore, SchedulerConfig};
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct MockUploader {
        platform: Platform,
        failures_left: AtomicU32,
        uploads: AtomicU32,
    }

    impl MockUploader {
        fn new(platform: Platform, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                platform,
                failures_left: AtomicU32::new(failures),
                uploads: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PlatformUploader for MockUploader {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn upload(
            &self,
            account: &SocialAccount,
            _request: &UploadRequest,
        ) -> Result<UploadResult, PlatformError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(PlatformError::Api {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(UploadResult {
                platform_post_id: format!("{}-post", account.id),
                post_url: Some(format!("https://{}/p/1", self.platform)),
                status: "published".into(),
            })
        }

        async fn get_analytics(
            &self,
            _account: &SocialAccount,
            _platform_post_id: &str,
        ) -> Result<PostAnalytics, PlatformError> {
            Ok(PostAnalytics {
                views: 42,
                engagement: 0.5,
                raw: serde_json::Value::Null,
            })
        }

        async fn delete_post(
            &self,
            _account: &SocialAccount,
            _platform_post_id: &str,
        ) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn get_trends(&self, _account: &SocialAccount) -> Result<Vec<Trend>, PlatformError> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        publisher: Arc<Publisher>,
        scheduler: Arc<Scheduler>,
        clock: Arc<ManualClock>,
        youtube: Arc<MockUploader>,
        tiktok: Arc<MockUploader>,
    }

    async fn harness(tiktok_failures: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let scheduler = Arc::new(
            Scheduler::new(
                Arc::new(MemoryJobStore::new()),
                SchedulerConfig::default()
                    .with_retry_backoff(Duration::from_secs(10))
                    .with_job_timeout(Duration::from_secs(5)),
            )
            .with_clock(clock.clone()),
        );
        let store = Arc::new(MemoryStore::new());
        for (id, platform) in [("yt-1", Platform::Youtube), ("tt-1", Platform::Tiktok)] {
            store
                .save_account(&SocialAccount::new(id, "user-1", platform, "@creator"))
                .await
                .unwrap();
        }
        store
            .save_account(&SocialAccount::new("yt-9", "someone-else", Platform::Youtube, "@x"))
            .await
            .unwrap();

        let youtube = MockUploader::new(Platform::Youtube, 0);
        let tiktok = MockUploader::new(Platform::Tiktok, tiktok_failures);
        let registry = PlatformRegistry::new()
            .with(youtube.clone())
            .with(tiktok.clone());
        let publisher = Arc::new(Publisher::new(
            store.clone(),
            store,
            registry,
            scheduler.clone(),
        ));
        publisher.register();
        Harness {
            publisher,
            scheduler,
            clock,
            youtube,
            tiktok,
        }
    }

    fn post(h: &Harness) -> ScheduledPost {
        ScheduledPost::new(
            "user-1",
            "video-1",
            "/videos/v1.mp4",
            h.clock.now() + chrono::Duration::minutes(30),
        )
        .with_timezone("Europe/Paris")
        .with_leg(PlatformPost::new("yt-1", Platform::Youtube, "Launch"))
        .with_leg(PlatformPost::new("tt-1", Platform::Tiktok, "Launch"))
    }

    #[tokio::test]
    async fn test_schedule_creates_one_job_per_leg() {
        let h = harness(0).await;
        let scheduled = h.publisher.schedule_publish(post(&h)).await.unwrap();
        assert_eq!(scheduled.status, PostStatus::Scheduled);
        assert!(scheduled.platforms.iter().all(|l| l.job_id.is_some()));
        assert_eq!(h.scheduler.get_queue_stats().await.unwrap().delayed, 2);

        // Not due yet.
        h.scheduler.run_pending().await.unwrap();
        assert_eq!(h.youtube.uploads.load(Ordering::SeqCst), 0);

        h.clock.advance(chrono::Duration::minutes(30));
        h.scheduler.run_pending().await.unwrap();

        let post = h.publisher.load_post(scheduled.id).await.unwrap();
        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(post.outcome, Some(Outcome::Succeeded));
        let leg = post.leg("yt-1").unwrap();
        assert_eq!(leg.platform_post_id.as_deref(), Some("yt-1-post"));
        assert!(leg.published_at.is_some());
    }

    #[tokio::test]
    async fn test_schedule_rejects_foreign_account() {
        let h = harness(0).await;
        let foreign = post(&h).with_leg(PlatformPost::new("yt-9", Platform::Youtube, "x"));
        let err = h.publisher.schedule_publish(foreign).await.unwrap_err();
        assert!(matches!(err, PublishError::Unauthorized { .. }));
        assert_eq!(h.scheduler.get_queue_stats().await.unwrap().delayed, 0);
    }

    #[tokio::test]
    async fn test_schedule_rejects_unknown_account_and_timezone() {
        let h = harness(0).await;
        let missing = post(&h).with_leg(PlatformPost::new("ig-1", Platform::Instagram, "x"));
        assert!(matches!(
            h.publisher.schedule_publish(missing).await,
            Err(PublishError::AccountNotFound(_))
        ));

        let bad_tz = post(&h).with_timezone("Not/AZone");
        assert!(matches!(
            h.publisher.schedule_publish(bad_tz).await,
            Err(PublishError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_post_jobs_are_noops() {
        let h = harness(0).await;
        let scheduled = h.publisher.schedule_publish(post(&h)).await.unwrap();
        h.publisher.cancel_post(scheduled.id).await.unwrap();

        h.clock.advance(chrono::Duration::hours(1));
        h.scheduler.run_pending().await.unwrap();

        assert_eq!(h.youtube.uploads.load(Ordering::SeqCst), 0);
        let post = h.publisher.load_post(scheduled.id).await.unwrap();
        assert_eq!(post.status, PostStatus::Cancelled);
        assert!(h.publisher.cancel_post(scheduled.id).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_now_runs_legs_immediately() {
        let h = harness(1).await;
        let scheduled = h.publisher.schedule_publish(post(&h)).await.unwrap();
        let post = h.publisher.publish_now(scheduled.id).await.unwrap();

        assert_eq!(post.leg("yt-1").unwrap().status, LegStatus::Published);
        assert_eq!(post.leg("tt-1").unwrap().status, LegStatus::Failed);
        assert_eq!(post.status, PostStatus::Failed);
        assert_eq!(post.outcome, Some(Outcome::Partial));
    }

    #[tokio::test]
    async fn test_retry_failed_post_only_reschedules_unpublished_legs() {
        let h = harness(1).await;
        let scheduled = h.publisher.schedule_publish(post(&h)).await.unwrap();
        h.publisher.publish_now(scheduled.id).await.unwrap();

        assert!(h.publisher.retry_failed_post(Uuid::new_v4()).await.is_err());
        let retried = h.publisher.retry_failed_post(scheduled.id).await.unwrap();
        assert_eq!(retried.status, PostStatus::Scheduled);
        assert!(retried.error.is_none());

        // The first tiktok job is superseded by the re-scheduled one.
        h.clock.advance(chrono::Duration::hours(1));
        h.scheduler.run_pending().await.unwrap();

        let post = h.publisher.load_post(scheduled.id).await.unwrap();
        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(h.youtube.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(h.tiktok.uploads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_list_queue_and_analytics() {
        let h = harness(0).await;
        let first = h.publisher.schedule_publish(post(&h)).await.unwrap();
        let queue = h.publisher.list_queue("user-1").await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, first.id);

        h.publisher.publish_now(first.id).await.unwrap();
        assert!(h.publisher.list_queue("user-1").await.unwrap().is_empty());

        let analytics = h.publisher.collect_analytics(first.id).await.unwrap();
        assert_eq!(analytics.len(), 2);
        assert!(analytics.iter().all(|a| a.analytics.views == 42));
    }
}
