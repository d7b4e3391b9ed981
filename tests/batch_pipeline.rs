//! End-to-end batch generation through the real worker pool and the
//! in-memory queue and store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use reelcast::batch::{
    AudioAsset, Batch, BatchOrchestrator, BatchStatus, ClipDraft, CreateBatchRequest,
    GenerationStages, OrchestratorConfig, Scene, Script, ScriptScene, TimelineDraft,
    VideoDefinition, VideoStatus, PROCESS_VIDEO_TASK,
};
use reelcast::error::{BatchError, StageError};
use reelcast::queue::{MemoryTaskQueue, TaskQueue, WorkerPool, WorkerPoolConfig};
use reelcast::storage::MemoryStore;
use reelcast::Outcome;

/// Scene generation fails for titles listed in `failures` until their
/// count runs out, or forever while `broken` is set.
#[derive(Default)]
struct StubStages {
    failures: Mutex<HashMap<String, u32>>,
    broken: Mutex<Option<String>>,
    healed: AtomicBool,
}

impl StubStages {
    fn failing(title: &str, times: u32) -> Self {
        let stages = Self::default();
        stages
            .failures
            .lock()
            .unwrap()
            .insert(title.to_string(), times);
        stages
    }

    fn broken(title: &str) -> Self {
        let stages = Self::default();
        *stages.broken.lock().unwrap() = Some(title.to_string());
        stages
    }

    fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationStages for StubStages {
    async fn generate_script(
        &self,
        prompt: &str,
        _style: &str,
        duration_secs: u32,
    ) -> Result<Script, StageError> {
        Ok(Script {
            title: prompt.to_string(),
            scenes: vec![ScriptScene {
                description: format!("{} opening", prompt),
                narration: format!("This is {}", prompt),
                duration_secs: f64::from(duration_secs),
            }],
        })
    }

    async fn generate_scenes(&self, script: &Script, _style: &str) -> Result<Vec<Scene>, StageError> {
        let gateway_error = || StageError::Api {
            status: 503,
            message: "scene renderer unavailable".into(),
        };
        if !self.healed.load(Ordering::SeqCst)
            && self.broken.lock().unwrap().as_deref() == Some(script.title.as_str())
        {
            return Err(gateway_error());
        }
        if let Some(left) = self.failures.lock().unwrap().get_mut(&script.title) {
            if *left > 0 {
                *left -= 1;
                return Err(gateway_error());
            }
        }
        Ok(script
            .scenes
            .iter()
            .enumerate()
            .map(|(idx, scene)| Scene {
                index: idx as u32,
                description: scene.description.clone(),
                duration_secs: scene.duration_secs,
                media_url: Some(format!("s3://scenes/{}-{}.mp4", script.title, idx)),
            })
            .collect())
    }

    async fn generate_voice(
        &self,
        text: &str,
        _voice_id: Option<&str>,
    ) -> Result<AudioAsset, StageError> {
        Ok(AudioAsset {
            url: format!("s3://voice/{}.mp3", text.len()),
            duration_secs: 60.0,
        })
    }

    async fn create_timeline(&self, draft: &TimelineDraft) -> Result<String, StageError> {
        Ok(format!("timeline-{}", draft.title))
    }

    async fn create_clip(&self, _timeline_id: &str, _clip: &ClipDraft) -> Result<String, StageError> {
        Ok(Uuid::new_v4().to_string())
    }
}

struct Pipeline {
    orchestrator: Arc<BatchOrchestrator>,
    queue: Arc<MemoryTaskQueue>,
    pool: WorkerPool,
}

async fn pipeline(stages: Arc<StubStages>) -> Pipeline {
    let queue = Arc::new(MemoryTaskQueue::new("batch_videos"));
    let orchestrator = Arc::new(BatchOrchestrator::new(
        Arc::new(MemoryStore::new()),
        queue.clone(),
        stages,
        OrchestratorConfig::default().with_task_timeout(Duration::from_secs(5)),
    ));

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(2)
            .with_poll_interval(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_secs(5)),
        queue.clone(),
    );
    pool.register_handler(PROCESS_VIDEO_TASK, orchestrator.clone());
    pool.start().await.unwrap();

    Pipeline {
        orchestrator,
        queue,
        pool,
    }
}

fn request(titles: &[&str]) -> CreateBatchRequest {
    CreateBatchRequest::new(titles.iter().map(|t| VideoDefinition::new(*t)).collect())
}

/// Polls until the batch reaches a terminal status.
async fn wait_for_settled(orchestrator: &BatchOrchestrator, batch_id: Uuid) -> Batch {
    for _ in 0..500 {
        let batch = orchestrator.get_batch(batch_id).await.unwrap();
        if batch.status.is_terminal() {
            return batch;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {} did not settle", batch_id);
}

#[tokio::test]
async fn test_batch_with_persistent_failure_ends_partial() {
    let stages = Arc::new(StubStages::broken("second"));
    let mut p = pipeline(stages).await;

    let batch = p
        .orchestrator
        .create_batch("creator-1", request(&["first", "second", "third"]))
        .await
        .unwrap();
    p.orchestrator.start_batch(batch.id).await.unwrap();

    let batch = wait_for_settled(&p.orchestrator, batch.id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.outcome, Some(Outcome::Partial));
    assert_eq!((batch.completed, batch.failed, batch.in_progress), (2, 1, 0));
    assert_eq!(batch.progress, 100.0);
    assert!(batch.completed_at.is_some());

    let results = p.orchestrator.get_batch_results(batch.id).await.unwrap();
    let statuses: Vec<VideoStatus> = results.videos.iter().map(|v| v.status).collect();
    assert_eq!(
        statuses,
        vec![VideoStatus::Completed, VideoStatus::Failed, VideoStatus::Completed]
    );
    assert_eq!(results.videos[1].attempts, 4);

    // The batch settles before the pool moves the task aside.
    let mut dead = Vec::new();
    for _ in 0..100 {
        dead = p.queue.peek_dead_letter(10).await.unwrap();
        if !dead.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dead.len(), 1);
    assert!(dead[0].error.contains("scene renderer unavailable"));
    assert_eq!(p.queue.stats().await.unwrap().pending_tasks, 0);

    p.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_recover_within_retry_budget() {
    let stages = Arc::new(StubStages::failing("flaky", 2));
    let mut p = pipeline(stages).await;

    let batch = p
        .orchestrator
        .create_batch("creator-1", request(&["steady", "flaky"]))
        .await
        .unwrap();
    p.orchestrator.start_batch(batch.id).await.unwrap();

    let batch = wait_for_settled(&p.orchestrator, batch.id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.outcome, Some(Outcome::Succeeded));
    assert_eq!(batch.failed, 0);

    let results = p.orchestrator.get_batch_results(batch.id).await.unwrap();
    let flaky = &results.videos[1];
    assert_eq!(flaky.attempts, 3);
    assert_eq!(flaky.timeline_id.as_deref(), Some("timeline-flaky"));
    assert!(flaky.error.is_none());

    p.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_failed_videos_completes_batch() {
    let stages = Arc::new(StubStages::broken("second"));
    let mut p = pipeline(stages.clone()).await;

    let batch = p
        .orchestrator
        .create_batch("creator-1", request(&["first", "second"]))
        .await
        .unwrap();
    p.orchestrator.start_batch(batch.id).await.unwrap();
    let settled = wait_for_settled(&p.orchestrator, batch.id).await;
    assert_eq!(settled.outcome, Some(Outcome::Partial));

    stages.heal();
    let reopened = p.orchestrator.retry_failed_videos(batch.id).await.unwrap();
    assert_eq!(reopened.status, BatchStatus::Processing);
    assert_eq!(reopened.failed, 0);
    assert!(reopened.completed_at.is_none());

    let batch = wait_for_settled(&p.orchestrator, batch.id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.outcome, Some(Outcome::Succeeded));
    assert_eq!((batch.completed, batch.failed), (2, 0));

    // Nothing left to retry, and the batch is untouched.
    let err = p.orchestrator.retry_failed_videos(batch.id).await.unwrap_err();
    assert!(matches!(err, BatchError::NoFailedVideos(_)));
    assert_eq!(p.orchestrator.get_batch(batch.id).await.unwrap(), batch);

    p.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_settled_batch_rejects_cancel_and_reports_progress() {
    let stages = Arc::new(StubStages::default());
    let mut p = pipeline(stages).await;

    let batch = p
        .orchestrator
        .create_batch("creator-2", request(&["only"]))
        .await
        .unwrap();
    p.orchestrator.start_batch(batch.id).await.unwrap();
    let batch = wait_for_settled(&p.orchestrator, batch.id).await;

    let err = p.orchestrator.cancel_batch(batch.id).await.unwrap_err();
    assert!(matches!(err, BatchError::InvalidState { action: "cancel", .. }));
    assert_eq!(p.orchestrator.get_batch(batch.id).await.unwrap(), batch);

    let progress = p.orchestrator.get_batch_progress(batch.id).await.unwrap();
    assert_eq!(progress.status, BatchStatus::Completed);
    assert_eq!(progress.completed, 1);
    assert!(progress.current_video.is_none());
    assert!(progress.eta_secs.is_none());

    let listed = p.orchestrator.list_batches("creator-2").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(p.orchestrator.list_batches("nobody").await.unwrap().is_empty());

    p.pool.shutdown().await.unwrap();
}
