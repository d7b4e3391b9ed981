//! Batch video generation.
//!
//! A batch is a set of up to [`MAX_BATCH_SIZE`] videos generated through the
//! same multi-stage pipeline:
//!
//! ```text
//!  create_batch ──► start_batch ──► TaskQueue ──► WorkerPool
//!                                                    │
//!                         ┌──────────────────────────┘
//!                         ▼
//!   script (25%) ─► scenes (50%) ─► voice (75%) ─► timeline (100%)
//! ```
//!
//! Every stage result is persisted on the video so a redelivered task
//! resumes after the last completed stage. Batch counters are updated
//! atomically in the store and the batch settles once every video has.

pub mod model;
pub mod orchestrator;
pub mod remote;
pub mod stages;

pub use model::{
    Batch, BatchProgress, BatchResults, BatchStatus, BatchVideo, CounterDelta,
    CreateBatchRequest, GenerationConfig, StageArtifacts, VideoDefinition, VideoOverrides,
    VideoStatus, MAX_BATCH_SIZE,
};
pub use orchestrator::{
    BatchOrchestrator, OrchestratorConfig, ProcessVideoPayload, PROCESS_VIDEO_TASK,
};
pub use remote::HttpGenerationClient;
pub use stages::{
    build_clips, AudioAsset, ClipDraft, GenerationStages, Scene, Script, ScriptScene, Stage,
    TimelineDraft,
};
