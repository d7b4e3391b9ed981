//! Batch lifecycle and per-video pipeline execution.
//!
//! The orchestrator owns batch state. Producers call [`BatchOrchestrator::start_batch`],
//! which enqueues one `batch:process_video` task per video; the worker pool
//! hands those tasks back through the [`TaskHandler`] implementation below.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{BatchError, StageError};
use crate::metrics::MetricsCollector;
use crate::queue::task::{DEFAULT_RETENTION, DEFAULT_TASK_TIMEOUT};
use crate::queue::{Task, TaskError, TaskHandler, TaskQueue, DEFAULT_MAX_RETRY};
use crate::storage::BatchRepository;

use super::model::{
    Batch, BatchProgress, BatchResults, BatchStatus, BatchVideo, CounterDelta, CreateBatchRequest,
    StageArtifacts, VideoStatus,
};
use super::stages::{build_clips, GenerationStages, Stage, TimelineDraft};

/// Task type routed to [`BatchOrchestrator`].
pub const PROCESS_VIDEO_TASK: &str = "batch:process_video";

/// Payload of a `batch:process_video` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessVideoPayload {
    pub batch_id: Uuid,
    pub video_id: Uuid,
}

/// Envelope settings for video tasks.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_retry: u32,
    pub task_timeout: Duration,
    pub result_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            result_retention: DEFAULT_RETENTION,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// How a pipeline run ended without error.
enum RunOutcome {
    Completed { timeline_id: String },
    Cancelled,
}

pub struct BatchOrchestrator {
    store: Arc<dyn BatchRepository>,
    queue: Arc<dyn TaskQueue>,
    stages: Arc<dyn GenerationStages>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    metrics: MetricsCollector,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn BatchRepository>,
        queue: Arc<dyn TaskQueue>,
        stages: Arc<dyn GenerationStages>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            stages,
            clock: Arc::new(SystemClock),
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the request and persists a `pending` batch with its videos.
    pub async fn create_batch(
        &self,
        user_id: &str,
        request: CreateBatchRequest,
    ) -> Result<Batch, BatchError> {
        request.validate()?;
        let now = self.clock.now();

        let batch = Batch::new(
            user_id,
            request.name.clone(),
            request.videos.len() as u32,
            request.config.clone(),
            now,
        );
        let videos: Vec<BatchVideo> = request
            .videos
            .iter()
            .enumerate()
            .map(|(position, definition)| {
                BatchVideo::from_definition(&batch, position as u32, definition, now)
            })
            .collect();

        self.store.insert_batch(&batch, &videos).await?;
        info!(
            batch_id = %batch.id,
            user_id = %user_id,
            videos = videos.len(),
            "Created batch"
        );
        Ok(batch)
    }

    /// `pending -> queued`, then one task per video.
    pub async fn start_batch(&self, batch_id: Uuid) -> Result<Batch, BatchError> {
        let now = self.clock.now();
        self.store
            .update_batch(batch_id, &move |batch: &mut Batch| batch.start(now))
            .await?;

        let videos = self.store.list_videos(batch_id).await?;
        let dispatched = self.dispatch(batch_id, videos).await?;
        info!(batch_id = %batch_id, dispatched, "Started batch");
        self.get_batch(batch_id).await
    }

    /// Marks each open video `queued` and enqueues it. A video whose enqueue
    /// fails is failed on the spot. Returns how many were enqueued.
    async fn dispatch(&self, batch_id: Uuid, videos: Vec<BatchVideo>) -> Result<usize, BatchError> {
        let mut dispatched = 0;
        for video in videos.into_iter().filter(|v| v.status.is_open()) {
            let now = self.clock.now();
            self.store
                .update_video(video.id, &move |v: &mut BatchVideo| v.mark_queued(now))
                .await?;

            let payload = ProcessVideoPayload {
                batch_id,
                video_id: video.id,
            };
            let payload = serde_json::to_value(payload)
                .map_err(|e| BatchError::InvalidPayload(e.to_string()))?;
            let task = Task::new(PROCESS_VIDEO_TASK, payload)
                .with_max_retry(self.config.max_retry)
                .with_timeout(self.config.task_timeout)
                .with_retention(self.config.result_retention);

            match self.queue.enqueue(task).await {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    error!(
                        batch_id = %batch_id,
                        video_id = %video.id,
                        error = %e,
                        "Failed to enqueue video"
                    );
                    let message = format!("enqueue failed: {}", e);
                    let now = self.clock.now();
                    self.store
                        .update_video(video.id, &move |v: &mut BatchVideo| {
                            v.fail_attempt(message.clone(), false, now);
                            Ok(())
                        })
                        .await?;
                    self.store
                        .adjust_counters(batch_id, CounterDelta::failed(false), now)
                        .await?;
                    self.metrics.record_batch_video(VideoStatus::Failed.as_str());
                }
            }
        }
        Ok(dispatched)
    }

    /// Runs the pipeline for one video. Entry point of the task handler.
    pub async fn process_video(&self, video_id: Uuid) -> Result<(), BatchError> {
        let video = self
            .store
            .get_video(video_id)
            .await?
            .ok_or(BatchError::VideoNotFound(video_id))?;
        if video.status.is_terminal() {
            debug!(video_id = %video_id, status = %video.status, "Video already settled, skipping");
            return Ok(());
        }
        let batch = self.get_batch(video.batch_id).await?;
        let was_running = video.status == VideoStatus::Processing;

        match batch.status {
            BatchStatus::Cancelled => {
                info!(batch_id = %batch.id, video_id = %video_id, "Batch cancelled, skipping video");
                self.abandon(&video, was_running).await?;
                return Ok(());
            }
            BatchStatus::Paused => {
                info!(batch_id = %batch.id, video_id = %video_id, "Batch paused, parking video");
                let now = self.clock.now();
                self.store
                    .update_video(video_id, &move |v: &mut BatchVideo| {
                        v.park(now);
                        Ok(())
                    })
                    .await?;
                if was_running {
                    self.store
                        .adjust_counters(batch.id, CounterDelta::released(), now)
                        .await?;
                }
                return Ok(());
            }
            _ => {}
        }

        let now = self.clock.now();
        let video = self
            .store
            .update_video(video_id, &move |v: &mut BatchVideo| v.claim(now).map(|_| ()))
            .await?;
        if was_running {
            info!(
                video_id = %video_id,
                progress = video.progress,
                "Resuming interrupted video"
            );
        } else {
            self.store
                .adjust_counters(batch.id, CounterDelta::started(), now)
                .await?;
        }

        info!(
            batch_id = %batch.id,
            video_id = %video_id,
            title = %video.title,
            attempt = video.attempts,
            "Processing video"
        );

        match self.run_stages(&batch, &video).await? {
            RunOutcome::Completed { timeline_id } => {
                let now = self.clock.now();
                let stored_id = timeline_id.clone();
                self.store
                    .update_video(video_id, &move |v: &mut BatchVideo| {
                        v.complete(stored_id.clone(), now);
                        Ok(())
                    })
                    .await?;
                let batch = self
                    .store
                    .adjust_counters(batch.id, CounterDelta::succeeded(), now)
                    .await?;
                self.metrics.record_batch_video(VideoStatus::Completed.as_str());
                info!(
                    batch_id = %batch.id,
                    video_id = %video_id,
                    timeline_id = %timeline_id,
                    progress = batch.progress,
                    "Video completed"
                );
                self.log_if_settled(&batch);
            }
            RunOutcome::Cancelled => {
                info!(video_id = %video_id, "Batch cancelled mid-pipeline, stopping video");
                self.abandon(&video, true).await?;
            }
        }
        Ok(())
    }

    /// Cancels a video that will not run; releases its slot if it held one.
    async fn abandon(&self, video: &BatchVideo, was_running: bool) -> Result<(), BatchError> {
        let now = self.clock.now();
        self.store
            .update_video(video.id, &move |v: &mut BatchVideo| {
                v.cancel(now);
                Ok(())
            })
            .await?;
        if was_running {
            self.store
                .adjust_counters(video.batch_id, CounterDelta::released(), now)
                .await?;
        }
        self.metrics.record_batch_video(VideoStatus::Cancelled.as_str());
        Ok(())
    }

    async fn is_cancelled(&self, batch_id: Uuid) -> Result<bool, BatchError> {
        Ok(self.get_batch(batch_id).await?.status == BatchStatus::Cancelled)
    }

    async fn save_artifacts(
        &self,
        video_id: Uuid,
        artifacts: &StageArtifacts,
        progress: u8,
    ) -> Result<(), BatchError> {
        let now = self.clock.now();
        let snapshot = artifacts.clone();
        self.store
            .update_video(video_id, &move |v: &mut BatchVideo| {
                v.artifacts = snapshot.clone();
                v.progress = progress;
                v.updated_at = now;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn timed<T, F>(&self, stage: Stage, video_id: Uuid, call: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        let started = Instant::now();
        let result = call.await;
        let elapsed = started.elapsed();
        self.metrics
            .record_stage(stage.as_str(), result.is_ok(), elapsed.as_secs_f64());
        debug!(
            video_id = %video_id,
            stage = %stage,
            success = result.is_ok(),
            duration_ms = elapsed.as_millis() as u64,
            "Stage finished"
        );
        result
    }

    /// script -> scenes -> voice -> timeline, skipping stages whose artifacts
    /// survive from an earlier attempt.
    async fn run_stages(&self, batch: &Batch, video: &BatchVideo) -> Result<RunOutcome, BatchError> {
        let mut artifacts = video.artifacts.clone();
        let config = &video.config;
        let stage_error = |stage: Stage| move |source: StageError| BatchError::Stage {
            stage: stage.as_str(),
            source,
        };

        let script = match artifacts.script.clone() {
            Some(script) => script,
            None => {
                if self.is_cancelled(batch.id).await? {
                    return Ok(RunOutcome::Cancelled);
                }
                let prompt = video.script_prompt();
                let script = self
                    .timed(
                        Stage::Script,
                        video.id,
                        self.stages
                            .generate_script(&prompt, &config.style, config.duration_secs),
                    )
                    .await
                    .map_err(stage_error(Stage::Script))?;
                artifacts.script = Some(script.clone());
                self.save_artifacts(video.id, &artifacts, Stage::Script.progress_after())
                    .await?;
                script
            }
        };

        let scenes = match artifacts.scenes.clone() {
            Some(scenes) => scenes,
            None => {
                if self.is_cancelled(batch.id).await? {
                    return Ok(RunOutcome::Cancelled);
                }
                let scenes = self
                    .timed(
                        Stage::Scenes,
                        video.id,
                        self.stages.generate_scenes(&script, &config.style),
                    )
                    .await
                    .map_err(stage_error(Stage::Scenes))?;
                artifacts.scenes = Some(scenes.clone());
                self.save_artifacts(video.id, &artifacts, Stage::Scenes.progress_after())
                    .await?;
                scenes
            }
        };

        if !artifacts.voice_done {
            if self.is_cancelled(batch.id).await? {
                return Ok(RunOutcome::Cancelled);
            }
            let narration = script.narration();
            if !narration.is_empty() {
                let voice = self
                    .timed(
                        Stage::Voice,
                        video.id,
                        self.stages
                            .generate_voice(&narration, config.voice_id.as_deref()),
                    )
                    .await;
                match voice {
                    Ok(audio) => artifacts.audio = Some(audio),
                    Err(e) => warn!(
                        video_id = %video.id,
                        error = %e,
                        "Voice synthesis failed, continuing without narration"
                    ),
                }
            }
            artifacts.voice_done = true;
            self.save_artifacts(video.id, &artifacts, Stage::Voice.progress_after())
                .await?;
        }

        if self.is_cancelled(batch.id).await? {
            return Ok(RunOutcome::Cancelled);
        }
        let timeline_id = match artifacts.timeline_id.clone() {
            Some(id) => id,
            None => {
                let draft = TimelineDraft {
                    user_id: batch.user_id.clone(),
                    title: video.title.clone(),
                    description: video.description.clone(),
                    aspect_ratio: config.aspect_ratio.clone(),
                    duration_secs: script.total_duration_secs(),
                };
                let id = self
                    .timed(
                        Stage::Timeline,
                        video.id,
                        self.stages.create_timeline(&draft),
                    )
                    .await
                    .map_err(stage_error(Stage::Timeline))?;
                artifacts.timeline_id = Some(id.clone());
                self.save_artifacts(video.id, &artifacts, Stage::Voice.progress_after())
                    .await?;
                id
            }
        };

        let clips = build_clips(&scenes, artifacts.audio.as_ref());
        for clip in clips.iter().skip(artifacts.clip_ids.len()) {
            let clip_id = self
                .timed(
                    Stage::Timeline,
                    video.id,
                    self.stages.create_clip(&timeline_id, clip),
                )
                .await
                .map_err(stage_error(Stage::Timeline))?;
            artifacts.clip_ids.push(clip_id);
            self.save_artifacts(video.id, &artifacts, Stage::Voice.progress_after())
                .await?;
        }

        Ok(RunOutcome::Completed { timeline_id })
    }

    /// Records a failed attempt. A video that will be redelivered goes back
    /// to `queued`; otherwise it is failed and counted.
    pub async fn settle_failure(
        &self,
        video_id: Uuid,
        error: &str,
        will_retry: bool,
    ) -> Result<(), BatchError> {
        let Some(video) = self.store.get_video(video_id).await? else {
            return Ok(());
        };
        let was_running = video.status == VideoStatus::Processing;
        if video.status.is_terminal() || (!was_running && will_retry) {
            return Ok(());
        }

        let now = self.clock.now();
        let message = error.to_string();
        self.store
            .update_video(video_id, &move |v: &mut BatchVideo| {
                v.fail_attempt(message.clone(), will_retry, now);
                Ok(())
            })
            .await?;

        let delta = if will_retry {
            CounterDelta::released()
        } else {
            CounterDelta::failed(was_running)
        };
        let batch = self
            .store
            .adjust_counters(video.batch_id, delta, now)
            .await?;

        if will_retry {
            warn!(
                batch_id = %batch.id,
                video_id = %video_id,
                error = %error,
                "Video attempt failed, will retry"
            );
        } else {
            self.metrics.record_batch_video(VideoStatus::Failed.as_str());
            error!(
                batch_id = %batch.id,
                video_id = %video_id,
                error = %error,
                "Video failed"
            );
            self.log_if_settled(&batch);
        }
        Ok(())
    }

    fn log_if_settled(&self, batch: &Batch) {
        if let Some(outcome) = batch.outcome {
            info!(
                batch_id = %batch.id,
                status = %batch.status,
                outcome = %outcome,
                completed = batch.completed,
                failed = batch.failed,
                "Batch settled"
            );
        }
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> Result<Batch, BatchError> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or(BatchError::NotFound(batch_id))
    }

    pub async fn list_batches(&self, user_id: &str) -> Result<Vec<Batch>, BatchError> {
        Ok(self.store.list_batches(user_id).await?)
    }

    pub async fn get_batch_results(&self, batch_id: Uuid) -> Result<BatchResults, BatchError> {
        let batch = self.get_batch(batch_id).await?;
        let videos = self.store.list_videos(batch_id).await?;
        Ok(BatchResults { batch, videos })
    }

    pub async fn get_batch_progress(&self, batch_id: Uuid) -> Result<BatchProgress, BatchError> {
        let batch = self.get_batch(batch_id).await?;
        let videos = self.store.list_videos(batch_id).await?;
        Ok(BatchProgress::compute(&batch, &videos, self.clock.now()))
    }

    /// Cancels the batch and every video not yet picked up. Running videos
    /// stop at their next stage boundary.
    pub async fn cancel_batch(&self, batch_id: Uuid) -> Result<Batch, BatchError> {
        let now = self.clock.now();
        let batch = self
            .store
            .update_batch(batch_id, &move |batch: &mut Batch| batch.cancel(now))
            .await?;
        let cancelled = self
            .store
            .update_videos(batch_id, &move |v: &mut BatchVideo| {
                v.status.is_open() && v.cancel(now)
            })
            .await?;
        info!(batch_id = %batch_id, videos = cancelled.len(), "Cancelled batch");
        Ok(batch)
    }

    pub async fn pause_batch(&self, batch_id: Uuid) -> Result<Batch, BatchError> {
        let now = self.clock.now();
        let batch = self
            .store
            .update_batch(batch_id, &move |batch: &mut Batch| batch.pause(now))
            .await?;
        info!(batch_id = %batch_id, "Paused batch");
        Ok(batch)
    }

    /// `paused -> processing` and re-dispatch of parked videos.
    pub async fn resume_batch(&self, batch_id: Uuid) -> Result<Batch, BatchError> {
        let now = self.clock.now();
        self.store
            .update_batch(batch_id, &move |batch: &mut Batch| batch.resume(now))
            .await?;
        let parked: Vec<BatchVideo> = self
            .store
            .list_videos(batch_id)
            .await?
            .into_iter()
            .filter(|v| v.status == VideoStatus::Pending)
            .collect();
        let dispatched = self.dispatch(batch_id, parked).await?;
        info!(batch_id = %batch_id, dispatched, "Resumed batch");
        self.get_batch(batch_id).await
    }

    /// Re-dispatches every failed video. Errors without touching anything
    /// when no video failed.
    pub async fn retry_failed_videos(&self, batch_id: Uuid) -> Result<Batch, BatchError> {
        let failed = self
            .store
            .list_videos(batch_id)
            .await?
            .iter()
            .filter(|v| v.status == VideoStatus::Failed)
            .count() as u32;
        if failed == 0 {
            // Surface NotFound before NoFailedVideos.
            self.get_batch(batch_id).await?;
            return Err(BatchError::NoFailedVideos(batch_id));
        }

        let now = self.clock.now();
        self.store
            .update_batch(batch_id, &move |batch: &mut Batch| {
                batch.reopen_failed(failed, now)
            })
            .await?;
        let reset = self
            .store
            .update_videos(batch_id, &move |v: &mut BatchVideo| v.reset_failed(now))
            .await?;
        let dispatched = self.dispatch(batch_id, reset).await?;
        info!(batch_id = %batch_id, dispatched, "Retrying failed videos");
        self.get_batch(batch_id).await
    }
}

fn payload_video_id(task: &Task) -> Result<Uuid, TaskError> {
    task.payload_as::<ProcessVideoPayload>()
        .map(|payload| payload.video_id)
        .map_err(|e| TaskError::InvalidPayload(e.to_string()))
}

#[async_trait]
impl TaskHandler for BatchOrchestrator {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        let video_id = payload_video_id(task)?;
        self.process_video(video_id).await.map_err(|e| match e {
            BatchError::NotFound(_)
            | BatchError::VideoNotFound(_)
            | BatchError::InvalidVideoState { .. }
            | BatchError::InvalidPayload(_) => TaskError::InvalidPayload(e.to_string()),
            other => TaskError::Failed(other.to_string()),
        })
    }

    async fn on_failure(&self, task: &Task, error: &TaskError, will_retry: bool) {
        let Ok(video_id) = payload_video_id(task) else {
            return;
        };
        if let Err(e) = self
            .settle_failure(video_id, &error.to_string(), will_retry)
            .await
        {
            error!(video_id = %video_id, error = %e, "Failed to record video failure");
        }
    }
}
