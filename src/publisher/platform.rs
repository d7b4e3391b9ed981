//! Uniform capability over social platforms and the registry resolving it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlatformError, PublishError};

use super::model::{Platform, Privacy, SocialAccount};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub video_path: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub privacy: Privacy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub platform_post_id: String,
    #[serde(default)]
    pub post_url: Option<String>,
    /// Platform-reported state, e.g. "published" or "processing".
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostAnalytics {
    pub views: u64,
    pub engagement: f64,
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub name: String,
    #[serde(default)]
    pub volume: Option<u64>,
}

#[async_trait]
pub trait PlatformUploader: Send + Sync {
    fn platform(&self) -> Platform;

    async fn upload(
        &self,
        account: &SocialAccount,
        request: &UploadRequest,
    ) -> Result<UploadResult, PlatformError>;

    async fn get_analytics(
        &self,
        account: &SocialAccount,
        platform_post_id: &str,
    ) -> Result<PostAnalytics, PlatformError>;

    async fn delete_post(
        &self,
        account: &SocialAccount,
        platform_post_id: &str,
    ) -> Result<(), PlatformError>;

    async fn get_trends(&self, account: &SocialAccount) -> Result<Vec<Trend>, PlatformError>;
}

/// Platform -> uploader map, filled at startup.
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    uploaders: HashMap<Platform, Arc<dyn PlatformUploader>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an uploader under its own platform, replacing any previous one.
    pub fn register(&mut self, uploader: Arc<dyn PlatformUploader>) {
        self.uploaders.insert(uploader.platform(), uploader);
    }

    pub fn with(mut self, uploader: Arc<dyn PlatformUploader>) -> Self {
        self.register(uploader);
        self
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn PlatformUploader>, PublishError> {
        self.uploaders
            .get(&platform)
            .cloned()
            .ok_or_else(|| PublishError::UnsupportedPlatform(platform.to_string()))
    }

    pub fn contains(&self, platform: Platform) -> bool {
        self.uploaders.contains_key(&platform)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.uploaders.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// JSON-over-HTTP uploader that talks to a platform gateway.
///
/// Requests go to `{api_base}/{platform}/...` with the account id and token
/// in headers.
pub struct HttpPlatformClient {
    platform: Platform,
    api_base: String,
    api_key: Option<String>,
    http_client: Client,
}

impl HttpPlatformClient {
    pub fn new(
        platform: Platform,
        api_base: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, PlatformError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| PlatformError::Request(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            platform,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.api_base, self.platform, path)
    }

    fn request(&self, method: Method, path: &str, account: &SocialAccount) -> RequestBuilder {
        let url = self.url(path);
        debug!(url = %url, account_id = %account.id, "Calling platform gateway");
        let mut request = self
            .http_client
            .request(method, url)
            .header("X-Account-Id", account.id.as_str());
        if let Some(ref api_key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        if let Some(ref token) = account.access_token {
            request = request.header("X-Account-Token", token.as_str());
        }
        request
    }

    async fn send(request: RequestBuilder) -> Result<Response, PlatformError> {
        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let status_code = status.as_u16();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        let message = serde_json::from_str::<ApiErrorBody>(&error_text)
            .map(|body| body.error.message)
            .unwrap_or(error_text);

        Err(match status_code {
            401 | 403 => PlatformError::Auth(message),
            429 => PlatformError::RateLimited(message),
            _ => PlatformError::Api {
                status: status_code,
                message,
            },
        })
    }

    async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, PlatformError> {
        Self::send(request)
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PlatformUploader for HttpPlatformClient {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn upload(
        &self,
        account: &SocialAccount,
        request: &UploadRequest,
    ) -> Result<UploadResult, PlatformError> {
        let http = self.request(Method::POST, "/uploads", account).json(request);
        Self::send_json(http).await
    }

    async fn get_analytics(
        &self,
        account: &SocialAccount,
        platform_post_id: &str,
    ) -> Result<PostAnalytics, PlatformError> {
        let path = format!("/posts/{}/analytics", platform_post_id);
        Self::send_json(self.request(Method::GET, &path, account)).await
    }

    async fn delete_post(
        &self,
        account: &SocialAccount,
        platform_post_id: &str,
    ) -> Result<(), PlatformError> {
        let path = format!("/posts/{}", platform_post_id);
        Self::send(self.request(Method::DELETE, &path, account)).await?;
        Ok(())
    }

    async fn get_trends(&self, account: &SocialAccount) -> Result<Vec<Trend>, PlatformError> {
        Self::send_json(self.request(Method::GET, "/trends", account)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_registered_platforms() {
        let registry = PlatformRegistry::new()
            .with(Arc::new(
                HttpPlatformClient::new(Platform::Youtube, "http://gw", None).unwrap(),
            ))
            .with(Arc::new(
                HttpPlatformClient::new(Platform::Tiktok, "http://gw", None).unwrap(),
            ));

        assert_eq!(registry.platforms(), vec![Platform::Youtube, Platform::Tiktok]);
        assert!(registry.get(Platform::Youtube).is_ok());
        assert!(matches!(
            registry.get(Platform::Linkedin),
            Err(PublishError::UnsupportedPlatform(p)) if p == "linkedin"
        ));
    }

    #[test]
    fn test_client_url_layout() {
        let client = HttpPlatformClient::new(Platform::Instagram, "http://gw/api/", None).unwrap();
        assert_eq!(client.url("/uploads"), "http://gw/api/instagram/uploads");
    }

    #[tokio::test]
    async fn test_upload_connection_error() {
        let client = HttpPlatformClient::new(Platform::Youtube, "http://localhost:65535", None).unwrap();
        let account = SocialAccount::new("acc", "user", Platform::Youtube, "@me");
        let request = UploadRequest {
            video_path: "/v.mp4".into(),
            title: "t".into(),
            description: String::new(),
            tags: vec![],
            privacy: Privacy::Public,
        };
        let result = client.upload(&account, &request).await;
        assert!(matches!(result, Err(PlatformError::Request(_))));
    }
}
