//! Scheduled posts, their per-account legs and social accounts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PublishError;
use crate::outcome::Outcome;
use crate::scheduler::RecurringRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Tiktok,
    Instagram,
    Twitter,
    Facebook,
    Linkedin,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Youtube,
        Platform::Tiktok,
        Platform::Instagram,
        Platform::Twitter,
        Platform::Facebook,
        Platform::Linkedin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::Linkedin => "linkedin",
        }
    }

    /// Longest text body the platform accepts, in characters.
    pub fn max_text_len(&self) -> usize {
        match self {
            Platform::Twitter => 280,
            Platform::Tiktok | Platform::Instagram => 2200,
            Platform::Linkedin => 3000,
            Platform::Youtube => 5000,
            Platform::Facebook => 63206,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "youtube" => Ok(Platform::Youtube),
            "tiktok" => Ok(Platform::Tiktok),
            "instagram" => Ok(Platform::Instagram),
            "twitter" | "x" => Ok(Platform::Twitter),
            "facebook" => Ok(Platform::Facebook),
            "linkedin" => Ok(Platform::Linkedin),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    #[default]
    Public,
    Unlisted,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegStatus {
    Pending,
    Publishing,
    Published,
    Failed,
}

impl LegStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegStatus::Pending => "pending",
            LegStatus::Publishing => "publishing",
            LegStatus::Published => "published",
            LegStatus::Failed => "failed",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, LegStatus::Published | LegStatus::Failed)
    }
}

impl fmt::Display for LegStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Scheduled,
    Publishing,
    Published,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Scheduled => "scheduled",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Published | PostStatus::Failed | PostStatus::Cancelled
        )
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(PostStatus::Scheduled),
            "publishing" => Ok(PostStatus::Publishing),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            "cancelled" => Ok(PostStatus::Cancelled),
            other => Err(format!("unknown post status '{}'", other)),
        }
    }
}

/// A connected account on a social platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl SocialAccount {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        platform: Platform,
        handle: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            platform,
            handle: handle.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

/// One target account of a scheduled post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformPost {
    pub account_id: String,
    pub platform: Platform,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub privacy: Privacy,
    pub status: LegStatus,
    #[serde(default)]
    pub platform_post_id: Option<String>,
    #[serde(default)]
    pub post_url: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Scheduler job that will publish this leg.
    #[serde(default)]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub attempts: u32,
}

impl PlatformPost {
    pub fn new(account_id: impl Into<String>, platform: Platform, title: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            platform,
            title: title.into(),
            description: String::new(),
            tags: Vec::new(),
            privacy: Privacy::default(),
            status: LegStatus::Pending,
            platform_post_id: None,
            post_url: None,
            published_at: None,
            error: None,
            job_id: None,
            attempts: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_privacy(mut self, privacy: Privacy) -> Self {
        self.privacy = privacy;
        self
    }

    pub fn begin(&mut self) {
        self.status = LegStatus::Publishing;
        self.attempts += 1;
    }

    pub fn mark_published(
        &mut self,
        platform_post_id: String,
        post_url: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = LegStatus::Published;
        self.platform_post_id = Some(platform_post_id);
        self.post_url = post_url;
        self.published_at = Some(now);
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = LegStatus::Failed;
        self.error = Some(error.into());
    }

    /// Back to `pending` for another round of publishing.
    pub fn reset(&mut self) {
        self.status = LegStatus::Pending;
        self.error = None;
        self.job_id = None;
        self.attempts = 0;
    }
}

/// A video publication to one or more accounts at a given time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: Uuid,
    pub user_id: String,
    pub video_id: String,
    pub video_path: String,
    pub scheduled_at: DateTime<Utc>,
    /// IANA zone the user scheduled in; `scheduled_at` is already UTC.
    pub timezone: String,
    #[serde(default)]
    pub recurring: Option<RecurringRule>,
    pub platforms: Vec<PlatformPost>,
    pub status: PostStatus,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledPost {
    pub fn new(
        user_id: impl Into<String>,
        video_id: impl Into<String>,
        video_path: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            video_id: video_id.into(),
            video_path: video_path.into(),
            scheduled_at,
            timezone: "UTC".to_string(),
            recurring: None,
            platforms: Vec::new(),
            status: PostStatus::Scheduled,
            outcome: None,
            error: None,
            created_at: scheduled_at,
            updated_at: scheduled_at,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_recurring(mut self, rule: RecurringRule) -> Self {
        self.recurring = Some(rule);
        self
    }

    pub fn with_leg(mut self, leg: PlatformPost) -> Self {
        self.platforms.push(leg);
        self
    }

    /// Name of the recurring definition that re-schedules this post.
    pub fn recurring_name(&self) -> String {
        format!("post:{}", self.id)
    }

    pub fn tz(&self) -> Result<Tz, PublishError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| PublishError::Validation(format!("unknown timezone '{}'", self.timezone)))
    }

    /// Scheduled time in the post's own timezone.
    pub fn local_scheduled_at(&self) -> Result<DateTime<Tz>, PublishError> {
        Ok(self.scheduled_at.with_timezone(&self.tz()?))
    }

    pub fn leg(&self, account_id: &str) -> Option<&PlatformPost> {
        self.platforms.iter().find(|leg| leg.account_id == account_id)
    }

    pub fn leg_mut(&mut self, account_id: &str) -> Result<&mut PlatformPost, PublishError> {
        let post_id = self.id;
        self.platforms
            .iter_mut()
            .find(|leg| leg.account_id == account_id)
            .ok_or_else(|| PublishError::LegNotFound {
                post_id,
                account_id: account_id.to_string(),
            })
    }

    fn invalid(&self, action: &'static str) -> PublishError {
        PublishError::InvalidState {
            action,
            status: self.status.to_string(),
        }
    }

    /// Checks the parts of a post that do not need the account store.
    pub fn validate(&self) -> Result<(), PublishError> {
        if self.platforms.is_empty() {
            return Err(PublishError::Validation(
                "a post needs at least one target account".to_string(),
            ));
        }
        if self.video_path.trim().is_empty() {
            return Err(PublishError::Validation("video_path is empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for leg in &self.platforms {
            if !seen.insert(leg.account_id.as_str()) {
                return Err(PublishError::Validation(format!(
                    "account '{}' is targeted twice",
                    leg.account_id
                )));
            }
        }
        self.tz()?;
        Ok(())
    }

    /// Derives the aggregate status from the legs. Returns true when the
    /// post settled on this call.
    pub fn recompute_status(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == PostStatus::Cancelled {
            return false;
        }
        let before = self.status;
        let published = self
            .platforms
            .iter()
            .filter(|leg| leg.status == LegStatus::Published)
            .count() as u32;
        let failed = self
            .platforms
            .iter()
            .filter(|leg| leg.status == LegStatus::Failed)
            .count() as u32;
        let total = self.platforms.len() as u32;

        if total > 0 && published + failed == total {
            self.outcome = Some(Outcome::from_counts(published, failed));
            if failed == 0 {
                self.status = PostStatus::Published;
                self.error = None;
            } else {
                self.status = PostStatus::Failed;
                self.error = Some(self.failure_summary());
            }
        } else if self
            .platforms
            .iter()
            .any(|leg| leg.status != LegStatus::Pending)
        {
            self.status = PostStatus::Publishing;
        }
        self.updated_at = now;
        !before.is_terminal() && self.status.is_terminal()
    }

    fn failure_summary(&self) -> String {
        self.platforms
            .iter()
            .filter(|leg| leg.status == LegStatus::Failed)
            .map(|leg| {
                format!(
                    "{}: {}",
                    leg.account_id,
                    leg.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// `scheduled -> cancelled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), PublishError> {
        if self.status != PostStatus::Scheduled {
            return Err(self.invalid("cancel"));
        }
        self.status = PostStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the post as being published right now.
    pub fn begin_publishing(&mut self, now: DateTime<Utc>) -> Result<(), PublishError> {
        if !matches!(self.status, PostStatus::Scheduled | PostStatus::Publishing) {
            return Err(self.invalid("publish"));
        }
        self.status = PostStatus::Publishing;
        self.updated_at = now;
        Ok(())
    }

    /// `failed -> scheduled`, keeping published legs. Returns the account ids
    /// of the legs that need publishing again.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<Vec<String>, PublishError> {
        if self.status != PostStatus::Failed {
            return Err(self.invalid("retry"));
        }
        let mut reopened = Vec::new();
        for leg in &mut self.platforms {
            if leg.status != LegStatus::Published {
                leg.reset();
                reopened.push(leg.account_id.clone());
            }
        }
        self.status = PostStatus::Scheduled;
        self.outcome = None;
        self.error = None;
        self.updated_at = now;
        Ok(reopened)
    }

    /// Starts a new occurrence of a recurring post: every leg goes back to
    /// `pending`.
    pub fn reset_for_occurrence(
        &mut self,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), PublishError> {
        if self.status == PostStatus::Cancelled {
            return Err(self.invalid("re-schedule"));
        }
        for leg in &mut self.platforms {
            leg.reset();
        }
        self.scheduled_at = occurrence;
        self.status = PostStatus::Scheduled;
        self.outcome = None;
        self.error = None;
        self.updated_at = now;
        Ok(())
    }
}

/// Payload of a `publish` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishJobPayload {
    pub post_id: Uuid,
    pub account_id: String,
}

/// Payload of a `republish_post` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepublishPayload {
    pub post_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap()
    }

    fn two_leg_post() -> ScheduledPost {
        ScheduledPost::new("user-1", "video-1", "/videos/v1.mp4", at())
            .with_leg(PlatformPost::new("yt-1", Platform::Youtube, "Launch"))
            .with_leg(PlatformPost::new("tt-1", Platform::Tiktok, "Launch"))
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("YouTube".parse::<Platform>(), Ok(Platform::Youtube));
        assert_eq!("x".parse::<Platform>(), Ok(Platform::Twitter));
        assert!("myspace".parse::<Platform>().is_err());
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>(), Ok(platform));
        }
    }

    #[test]
    fn test_validate_rejects_empty_and_bad_timezone() {
        let empty = ScheduledPost::new("u", "v", "/v.mp4", at());
        assert!(matches!(empty.validate(), Err(PublishError::Validation(_))));

        let bad_tz = two_leg_post().with_timezone("Mars/Olympus");
        let err = bad_tz.validate().unwrap_err();
        assert!(err.to_string().contains("Mars/Olympus"));

        let ok = two_leg_post().with_timezone("America/New_York");
        assert!(ok.validate().is_ok());
        assert_eq!(
            ok.local_scheduled_at().unwrap().format("%H:%M").to_string(),
            "11:00"
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_accounts() {
        let post = two_leg_post().with_leg(PlatformPost::new("yt-1", Platform::Youtube, "again"));
        assert!(post.validate().is_err());
    }

    #[test]
    fn test_recompute_published_only_when_all_legs_published() {
        let mut post = two_leg_post();
        post.leg_mut("yt-1").unwrap().mark_published("abc".into(), None, at());
        assert!(!post.recompute_status(at()));
        assert_eq!(post.status, PostStatus::Publishing);

        post.leg_mut("tt-1").unwrap().mark_published("def".into(), None, at());
        assert!(post.recompute_status(at()));
        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(post.outcome, Some(Outcome::Succeeded));

        // Settling again does not flip the parent a second time.
        assert!(!post.recompute_status(at()));
    }

    #[test]
    fn test_recompute_partial_failure() {
        let mut post = two_leg_post();
        post.leg_mut("yt-1").unwrap().mark_published("abc".into(), None, at());
        post.leg_mut("tt-1").unwrap().mark_failed("quota exceeded");
        assert!(post.recompute_status(at()));
        assert_eq!(post.status, PostStatus::Failed);
        assert_eq!(post.outcome, Some(Outcome::Partial));
        assert_eq!(post.error.as_deref(), Some("tt-1: quota exceeded"));
    }

    #[test]
    fn test_cancel_only_scheduled() {
        let mut post = two_leg_post();
        post.cancel(at()).unwrap();
        assert!(post.cancel(at()).is_err());
        post.leg_mut("yt-1").unwrap().mark_published("abc".into(), None, at());
        assert!(!post.recompute_status(at()));
        assert_eq!(post.status, PostStatus::Cancelled);
    }

    #[test]
    fn test_reset_for_retry_keeps_published_legs() {
        let mut post = two_leg_post();
        assert!(post.reset_for_retry(at()).is_err());

        post.leg_mut("yt-1").unwrap().mark_published("abc".into(), None, at());
        post.leg_mut("tt-1").unwrap().mark_failed("boom");
        post.recompute_status(at());

        let reopened = post.reset_for_retry(at()).unwrap();
        assert_eq!(reopened, vec!["tt-1".to_string()]);
        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.leg("yt-1").unwrap().status, LegStatus::Published);
        assert_eq!(post.leg("tt-1").unwrap().status, LegStatus::Pending);
        assert!(post.error.is_none());
    }

    #[test]
    fn test_leg_not_found() {
        let mut post = two_leg_post();
        assert!(matches!(
            post.leg_mut("ig-9"),
            Err(PublishError::LegNotFound { .. })
        ));
    }
}
