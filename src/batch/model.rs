//! Batch and batch-video records and their state transitions.
//!
//! Transitions are plain methods on the records. Repositories apply them
//! under a row lock (or mutex), so a method sees the current state and either
//! mutates it or returns an error that leaves the record untouched.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BatchError;
use crate::outcome::Outcome;

use super::stages::{AudioAsset, Scene, Script};

/// Largest number of videos accepted in one batch.
pub const MAX_BATCH_SIZE: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "queued" => Ok(BatchStatus::Queued),
            "processing" => Ok(BatchStatus::Processing),
            "paused" => Ok(BatchStatus::Paused),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Queued => "queued",
            VideoStatus::Processing => "processing",
            VideoStatus::Completed => "completed",
            VideoStatus::Failed => "failed",
            VideoStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VideoStatus::Completed | VideoStatus::Failed | VideoStatus::Cancelled
        )
    }

    /// Not yet picked up by a worker.
    pub fn is_open(&self) -> bool {
        matches!(self, VideoStatus::Pending | VideoStatus::Queued)
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VideoStatus::Pending),
            "queued" => Ok(VideoStatus::Queued),
            "processing" => Ok(VideoStatus::Processing),
            "completed" => Ok(VideoStatus::Completed),
            "failed" => Ok(VideoStatus::Failed),
            "cancelled" => Ok(VideoStatus::Cancelled),
            other => Err(format!("unknown video status '{}'", other)),
        }
    }
}

/// Generation settings shared by a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub style: String,
    pub duration_secs: u32,
    #[serde(default)]
    pub voice_id: Option<String>,
    pub aspect_ratio: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            style: "cinematic".to_string(),
            duration_secs: 60,
            voice_id: None,
            aspect_ratio: "9:16".to_string(),
        }
    }
}

/// Per-video overrides of the batch [`GenerationConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoOverrides {
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u32>,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

impl VideoOverrides {
    pub fn apply(&self, base: &GenerationConfig) -> GenerationConfig {
        GenerationConfig {
            style: self.style.clone().unwrap_or_else(|| base.style.clone()),
            duration_secs: self.duration_secs.unwrap_or(base.duration_secs),
            voice_id: self.voice_id.clone().or_else(|| base.voice_id.clone()),
            aspect_ratio: self
                .aspect_ratio
                .clone()
                .unwrap_or_else(|| base.aspect_ratio.clone()),
        }
    }
}

/// One requested video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Prompt for the script stage; the title and description are used when absent.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub config: VideoOverrides,
}

impl VideoDefinition {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            prompt: None,
            config: VideoOverrides::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: GenerationConfig,
    pub videos: Vec<VideoDefinition>,
}

impl CreateBatchRequest {
    pub fn new(videos: Vec<VideoDefinition>) -> Self {
        Self {
            name: None,
            config: GenerationConfig::default(),
            videos,
        }
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.videos.is_empty() || self.videos.len() > MAX_BATCH_SIZE {
            return Err(BatchError::Validation(format!(
                "a batch must contain between 1 and {} videos, got {}",
                MAX_BATCH_SIZE,
                self.videos.len()
            )));
        }
        if let Some(position) = self.videos.iter().position(|v| v.title.trim().is_empty()) {
            return Err(BatchError::Validation(format!(
                "video {} has an empty title",
                position + 1
            )));
        }
        if self.config.duration_secs == 0 {
            return Err(BatchError::Validation(
                "duration_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Signed changes to the batch counters, applied in one atomic step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub completed: i32,
    pub failed: i32,
    pub in_progress: i32,
}

impl CounterDelta {
    pub fn started() -> Self {
        Self {
            in_progress: 1,
            ..Default::default()
        }
    }

    pub fn succeeded() -> Self {
        Self {
            completed: 1,
            in_progress: -1,
            ..Default::default()
        }
    }

    /// A video failed for good. `was_running` is false when it never reached
    /// a worker (for example its enqueue failed).
    pub fn failed(was_running: bool) -> Self {
        Self {
            failed: 1,
            in_progress: if was_running { -1 } else { 0 },
            ..Default::default()
        }
    }

    /// A running video stopped without settling (retry, park or cancel).
    pub fn released() -> Self {
        Self {
            in_progress: -1,
            ..Default::default()
        }
    }
}

fn apply_signed(value: u32, delta: i32) -> u32 {
    if delta >= 0 {
        value.saturating_add(delta as u32)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub total_videos: u32,
    pub completed: u32,
    pub failed: u32,
    pub in_progress: u32,
    /// (completed + failed) / total * 100.
    pub progress: f64,
    pub status: BatchStatus,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    pub config: GenerationConfig,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(
        user_id: impl Into<String>,
        name: Option<String>,
        total_videos: u32,
        config: GenerationConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name,
            total_videos,
            completed: 0,
            failed: 0,
            in_progress: 0,
            progress: 0.0,
            status: BatchStatus::Pending,
            outcome: None,
            config,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    fn invalid(&self, action: &'static str) -> BatchError {
        BatchError::InvalidState {
            action,
            status: self.status.to_string(),
        }
    }

    pub fn settled(&self) -> u32 {
        self.completed + self.failed
    }

    pub fn remaining(&self) -> u32 {
        self.total_videos.saturating_sub(self.settled())
    }

    pub fn compute_progress(&self) -> f64 {
        if self.total_videos == 0 {
            return 0.0;
        }
        (f64::from(self.settled()) / f64::from(self.total_videos) * 100.0).min(100.0)
    }

    /// `pending -> queued`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), BatchError> {
        if self.status != BatchStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.status = BatchStatus::Queued;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Applies a counter delta, moves `queued -> processing` when work
    /// starts, and settles the batch once every video has settled.
    pub fn apply_counters(&mut self, delta: CounterDelta, now: DateTime<Utc>) {
        self.completed = apply_signed(self.completed, delta.completed);
        self.failed = apply_signed(self.failed, delta.failed);
        self.in_progress = apply_signed(self.in_progress, delta.in_progress);

        // Keep completed + failed + in_progress within the declared total.
        self.completed = self.completed.min(self.total_videos);
        self.failed = self.failed.min(self.total_videos - self.completed);
        self.in_progress = self.in_progress.min(self.remaining());

        if delta.in_progress > 0 && self.status == BatchStatus::Queued {
            self.status = BatchStatus::Processing;
        }
        self.progress = self.compute_progress();
        self.updated_at = now;
        self.settle_if_done(now);
    }

    fn settle_if_done(&mut self, now: DateTime<Utc>) {
        let open = matches!(
            self.status,
            BatchStatus::Queued | BatchStatus::Processing | BatchStatus::Paused
        );
        if !open || self.settled() < self.total_videos {
            return;
        }
        self.status = if self.completed > 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        };
        self.outcome = Some(Outcome::from_counts(self.completed, self.failed));
        self.in_progress = 0;
        self.completed_at = Some(now);
    }

    /// Rejected once the batch is completed, failed or already cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), BatchError> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.status = BatchStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Allowed from `queued` and `processing`.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), BatchError> {
        if !matches!(self.status, BatchStatus::Queued | BatchStatus::Processing) {
            return Err(self.invalid("pause"));
        }
        self.status = BatchStatus::Paused;
        self.updated_at = now;
        Ok(())
    }

    /// `paused -> processing`.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), BatchError> {
        if self.status != BatchStatus::Paused {
            return Err(self.invalid("resume"));
        }
        self.status = BatchStatus::Processing;
        self.updated_at = now;
        Ok(())
    }

    /// Takes `count` failed videos out of the failed counter so they can be
    /// dispatched again. Clears completed-at and outcome.
    pub fn reopen_failed(&mut self, count: u32, now: DateTime<Utc>) -> Result<(), BatchError> {
        if matches!(self.status, BatchStatus::Pending | BatchStatus::Cancelled) {
            return Err(self.invalid("retry"));
        }
        if count == 0 || self.failed == 0 {
            return Err(BatchError::NoFailedVideos(self.id));
        }
        self.failed = self.failed.saturating_sub(count);
        if self.status != BatchStatus::Paused {
            self.status = BatchStatus::Processing;
        }
        self.outcome = None;
        self.completed_at = None;
        self.error = None;
        self.progress = self.compute_progress();
        self.updated_at = now;
        Ok(())
    }
}

/// Intermediate results persisted after each stage so a redelivered video
/// resumes after the last completed stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageArtifacts {
    #[serde(default)]
    pub script: Option<Script>,
    #[serde(default)]
    pub scenes: Option<Vec<Scene>>,
    #[serde(default)]
    pub audio: Option<AudioAsset>,
    /// Voice synthesis ran (successfully or not) and must not run again.
    #[serde(default)]
    pub voice_done: bool,
    /// Timeline created by an interrupted run; later clips are added to it.
    #[serde(default)]
    pub timeline_id: Option<String>,
    /// Ids of clips already attached to `timeline_id`, in clip order.
    #[serde(default)]
    pub clip_ids: Vec<String>,
}

impl StageArtifacts {
    /// Progress implied by the stored artifacts.
    pub fn progress(&self) -> u8 {
        if self.voice_done {
            75
        } else if self.scenes.is_some() {
            50
        } else if self.script.is_some() {
            25
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchVideo {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Zero-based position in the request.
    pub position: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Effective settings (batch config with overrides applied).
    pub config: GenerationConfig,
    pub status: VideoStatus,
    /// 0, 25, 50, 75 or 100.
    pub progress: u8,
    #[serde(default)]
    pub timeline_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub artifacts: StageArtifacts,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BatchVideo {
    pub fn from_definition(
        batch: &Batch,
        position: u32,
        definition: &VideoDefinition,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            position,
            title: definition.title.trim().to_string(),
            description: definition.description.clone(),
            prompt: definition.prompt.clone(),
            config: definition.config.apply(&batch.config),
            status: VideoStatus::Pending,
            progress: 0,
            timeline_id: None,
            error: None,
            attempts: 0,
            artifacts: StageArtifacts::default(),
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    fn invalid(&self, action: &'static str) -> BatchError {
        BatchError::InvalidVideoState {
            action,
            status: self.status.to_string(),
        }
    }

    /// Prompt sent to the script stage.
    pub fn script_prompt(&self) -> String {
        match &self.prompt {
            Some(prompt) if !prompt.trim().is_empty() => prompt.clone(),
            _ if self.description.trim().is_empty() => self.title.clone(),
            _ => format!("{}\n\n{}", self.title, self.description),
        }
    }

    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<(), BatchError> {
        if !self.status.is_open() {
            return Err(self.invalid("queue"));
        }
        self.status = VideoStatus::Queued;
        self.updated_at = now;
        Ok(())
    }

    /// Takes the video for processing. Returns true when the video was
    /// already processing (a redelivery after an interrupted run).
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<bool, BatchError> {
        let resumed = match self.status {
            VideoStatus::Pending | VideoStatus::Queued => false,
            VideoStatus::Processing => true,
            _ => return Err(self.invalid("process")),
        };
        self.status = VideoStatus::Processing;
        self.attempts += 1;
        self.error = None;
        self.progress = self.artifacts.progress();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
        Ok(resumed)
    }

    pub fn complete(&mut self, timeline_id: String, now: DateTime<Utc>) {
        self.status = VideoStatus::Completed;
        self.progress = 100;
        self.timeline_id = Some(timeline_id);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Records a failed attempt: back to `queued` when it will be retried,
    /// `failed` otherwise.
    pub fn fail_attempt(&mut self, error: impl Into<String>, will_retry: bool, now: DateTime<Utc>) {
        self.status = if will_retry {
            VideoStatus::Queued
        } else {
            VideoStatus::Failed
        };
        self.progress = 0;
        self.error = Some(error.into());
        if !will_retry {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Cancels a video that has not settled. Returns whether it changed.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = VideoStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Puts a video of a paused batch back to `pending`.
    pub fn park(&mut self, now: DateTime<Utc>) {
        if self.status.is_open() || self.status == VideoStatus::Processing {
            self.status = VideoStatus::Pending;
            self.updated_at = now;
        }
    }

    /// `failed -> pending` for retry. Keeps stage artifacts.
    pub fn reset_failed(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != VideoStatus::Failed {
            return false;
        }
        self.status = VideoStatus::Pending;
        self.progress = 0;
        self.error = None;
        self.completed_at = None;
        self.updated_at = now;
        true
    }
}

/// Point-in-time view of a batch for polling clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub outcome: Option<Outcome>,
    pub total_videos: u32,
    pub completed: u32,
    pub failed: u32,
    pub in_progress: u32,
    pub progress: f64,
    /// Title of a video currently being processed.
    pub current_video: Option<String>,
    pub elapsed_secs: Option<i64>,
    /// Estimated seconds until every video settles; absent before the first
    /// success.
    pub eta_secs: Option<i64>,
}

impl BatchProgress {
    pub fn compute(batch: &Batch, videos: &[BatchVideo], now: DateTime<Utc>) -> Self {
        let current_video = videos
            .iter()
            .filter(|v| v.status == VideoStatus::Processing)
            .min_by_key(|v| v.position)
            .map(|v| v.title.clone());

        let elapsed_secs = batch.started_at.map(|started| {
            let end = batch.completed_at.unwrap_or(now);
            (end - started).num_seconds().max(0)
        });

        let eta_secs = match elapsed_secs {
            Some(elapsed) if batch.completed > 0 && !batch.status.is_terminal() => {
                let per_video = elapsed as f64 / f64::from(batch.completed);
                Some((per_video * f64::from(batch.remaining())).round() as i64)
            }
            _ => None,
        };

        Self {
            batch_id: batch.id,
            status: batch.status,
            outcome: batch.outcome,
            total_videos: batch.total_videos,
            completed: batch.completed,
            failed: batch.failed,
            in_progress: batch.in_progress,
            progress: batch.progress,
            current_video,
            elapsed_secs,
            eta_secs,
        }
    }
}

/// A batch with all of its videos.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResults {
    pub batch: Batch,
    pub videos: Vec<BatchVideo>,
}
