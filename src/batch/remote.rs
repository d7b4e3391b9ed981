//! JSON-over-HTTP client for the generation service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StageError;

use super::stages::{AudioAsset, ClipDraft, GenerationStages, Scene, Script, TimelineDraft};

/// Default per-request timeout; script and scene generation are slow.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct ScriptRequest<'a> {
    prompt: &'a str,
    style: &'a str,
    duration_secs: u32,
}

#[derive(Debug, Serialize)]
struct ScenesRequest<'a> {
    script: &'a Script,
    style: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScenesResponse {
    scenes: Vec<Scene>,
}

#[derive(Debug, Serialize)]
struct VoiceRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Client for the generation gateway.
pub struct HttpGenerationClient {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http_client: Client,
}

impl HttpGenerationClient {
    /// # Arguments
    ///
    /// * `api_base` - Base URL of the generation service (e.g., "http://localhost:8080/v1")
    /// * `api_key` - Optional bearer token
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Result<Self, StageError> {
        Self::with_timeout(api_base, api_key, DEFAULT_STAGE_TIMEOUT)
    }

    pub fn with_timeout(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StageError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::Request(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
            http_client,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, StageError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.api_base, path);
        debug!(url = %url, "Calling generation service");

        let mut request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                StageError::Timeout(self.timeout)
            } else {
                StageError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorBody>(&error_text)
                .map(|body| body.error.message)
                .unwrap_or(error_text);
            return Err(StageError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| StageError::InvalidResponse(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl GenerationStages for HttpGenerationClient {
    async fn generate_script(
        &self,
        prompt: &str,
        style: &str,
        duration_secs: u32,
    ) -> Result<Script, StageError> {
        let script: Script = self
            .post_json(
                "/scripts",
                &ScriptRequest {
                    prompt,
                    style,
                    duration_secs,
                },
            )
            .await?;
        if script.scenes.is_empty() {
            return Err(StageError::InvalidResponse(
                "script has no scenes".to_string(),
            ));
        }
        Ok(script)
    }

    async fn generate_scenes(&self, script: &Script, style: &str) -> Result<Vec<Scene>, StageError> {
        let response: ScenesResponse = self
            .post_json("/scenes", &ScenesRequest { script, style })
            .await?;
        Ok(response.scenes)
    }

    async fn generate_voice(
        &self,
        text: &str,
        voice_id: Option<&str>,
    ) -> Result<AudioAsset, StageError> {
        self.post_json("/voice", &VoiceRequest { text, voice_id }).await
    }

    async fn create_timeline(&self, draft: &TimelineDraft) -> Result<String, StageError> {
        let response: IdResponse = self.post_json("/timelines", draft).await?;
        Ok(response.id)
    }

    async fn create_clip(&self, timeline_id: &str, clip: &ClipDraft) -> Result<String, StageError> {
        let path = format!("/timelines/{}/clips", timeline_id);
        let response: IdResponse = self.post_json(&path, clip).await?;
        Ok(response.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = HttpGenerationClient::new("http://localhost:8080/v1/", None).unwrap();
        assert_eq!(client.api_base(), "http://localhost:8080/v1");
    }

    #[test]
    fn test_voice_request_omits_missing_voice() {
        let body = serde_json::to_value(VoiceRequest {
            text: "hello",
            voice_id: None,
        })
        .unwrap();
        assert!(body.get("voice_id").is_none());
    }

    #[tokio::test]
    async fn test_connection_error_is_request_error() {
        let client = HttpGenerationClient::with_timeout(
            "http://localhost:65535",
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        let result = client.generate_script("prompt", "cinematic", 30).await;
        assert!(matches!(
            result,
            Err(StageError::Request(_)) | Err(StageError::Timeout(_))
        ));
    }
}
