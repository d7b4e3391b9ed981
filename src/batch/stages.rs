//! Content-generation capability used by the batch pipeline.
//!
//! Each call is an opaque, possibly slow, possibly failing remote operation.
//! The orchestrator only depends on this trait; [`super::remote`] provides an
//! HTTP implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Script,
    Scenes,
    Voice,
    Timeline,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Script => "script",
            Stage::Scenes => "scenes",
            Stage::Voice => "voice",
            Stage::Timeline => "timeline",
        }
    }

    /// Video progress once this stage has finished.
    pub fn progress_after(&self) -> u8 {
        match self {
            Stage::Script => 25,
            Stage::Scenes => 50,
            Stage::Voice => 75,
            Stage::Timeline => 100,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scene as written by the script stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptScene {
    pub description: String,
    #[serde(default)]
    pub narration: String,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub scenes: Vec<ScriptScene>,
}

impl Script {
    /// Narration of all scenes, in order, for voice synthesis.
    pub fn narration(&self) -> String {
        self.scenes
            .iter()
            .map(|scene| scene.narration.trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.scenes.iter().map(|scene| scene.duration_secs).sum()
    }
}

/// A scene with generated media attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub index: u32,
    pub description: String,
    pub duration_secs: f64,
    /// Generated image or video for this scene.
    #[serde(default)]
    pub media_url: Option<String>,
}

/// Synthesized narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAsset {
    pub url: String,
    pub duration_secs: f64,
}

/// Input for creating a timeline project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineDraft {
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub aspect_ratio: String,
    pub duration_secs: f64,
}

/// A clip placed on a timeline track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipDraft {
    /// "video" or "audio".
    pub track: String,
    pub source_url: String,
    pub start_secs: f64,
    pub duration_secs: f64,
    #[serde(default)]
    pub label: Option<String>,
}

#[async_trait]
pub trait GenerationStages: Send + Sync {
    async fn generate_script(
        &self,
        prompt: &str,
        style: &str,
        duration_secs: u32,
    ) -> Result<Script, StageError>;

    async fn generate_scenes(&self, script: &Script, style: &str)
        -> Result<Vec<Scene>, StageError>;

    async fn generate_voice(
        &self,
        text: &str,
        voice_id: Option<&str>,
    ) -> Result<AudioAsset, StageError>;

    /// Creates a timeline project and returns its id.
    async fn create_timeline(&self, draft: &TimelineDraft) -> Result<String, StageError>;

    /// Adds a clip to a timeline and returns the clip id.
    async fn create_clip(&self, timeline_id: &str, clip: &ClipDraft)
        -> Result<String, StageError>;
}

/// Lays scenes and narration out on video and audio tracks.
pub fn build_clips(scenes: &[Scene], audio: Option<&AudioAsset>) -> Vec<ClipDraft> {
    let mut clips = Vec::with_capacity(scenes.len() + 1);
    let mut cursor = 0.0;
    for scene in scenes {
        if let Some(url) = &scene.media_url {
            clips.push(ClipDraft {
                track: "video".to_string(),
                source_url: url.clone(),
                start_secs: cursor,
                duration_secs: scene.duration_secs,
                label: Some(format!("scene {}", scene.index + 1)),
            });
        }
        cursor += scene.duration_secs;
    }

    if let Some(audio) = audio {
        clips.push(ClipDraft {
            track: "audio".to_string(),
            source_url: audio.url.clone(),
            start_secs: 0.0,
            duration_secs: audio.duration_secs,
            label: Some("narration".to_string()),
        });
    }
    clips
}
