//! Error types for reelcast operations.
//!
//! Scheduler, job store and queue errors live next to their modules; this
//! file holds the errors of the persistence layer and of the two domain
//! services (batch generation and publishing) plus their collaborators.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::queue::QueueError;
use crate::scheduler::SchedulerError;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Errors from a content-generation stage call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stage timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from a social platform call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlatformError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl PlatformError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlatformError::Auth(_) => false,
            PlatformError::Api { status, .. } => *status >= 500 || *status == 408,
            _ => true,
        }
    }
}

/// Errors from batch orchestration.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Batch {0} not found")]
    NotFound(Uuid),

    #[error("Batch video {0} not found")]
    VideoNotFound(Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cannot {action} batch in status '{status}'")]
    InvalidState {
        action: &'static str,
        status: String,
    },

    #[error("Cannot {action} video in status '{status}'")]
    InvalidVideoState {
        action: &'static str,
        status: String,
    },

    #[error("Batch {0} has no failed videos")]
    NoFailedVideos(Uuid),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: &'static str,
        source: StageError,
    },

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from scheduling and publishing posts.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Post {0} not found")]
    PostNotFound(Uuid),

    #[error("Post {post_id} has no leg for account '{account_id}'")]
    LegNotFound { post_id: Uuid, account_id: String },

    #[error("Social account '{0}' not found")]
    AccountNotFound(String),

    #[error("Account '{account_id}' does not belong to user '{user_id}'")]
    Unauthorized { account_id: String, user_id: String },

    #[error("No uploader registered for platform '{0}'")]
    UnsupportedPlatform(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cannot {action} post in status '{status}'")]
    InvalidState {
        action: &'static str,
        status: String,
    },

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PublishError {
    /// Whether a scheduled attempt failing with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Platform(e) => e.is_retryable(),
            PublishError::Scheduler(_) | PublishError::Store(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_retryable() {
        assert!(PlatformError::Request("reset".into()).is_retryable());
        assert!(PlatformError::RateLimited("slow down".into()).is_retryable());
        assert!(PlatformError::Api {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!PlatformError::Api {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!PlatformError::Auth("token revoked".into()).is_retryable());
    }

    #[test]
    fn test_publish_error_retryable() {
        assert!(PublishError::Platform(PlatformError::Request("x".into())).is_retryable());
        assert!(!PublishError::AccountNotFound("acc".into()).is_retryable());
        assert!(!PublishError::Unauthorized {
            account_id: "acc".into(),
            user_id: "u".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_batch_error_display() {
        let err = BatchError::InvalidState {
            action: "cancel",
            status: "completed".into(),
        };
        assert_eq!(err.to_string(), "Cannot cancel batch in status 'completed'");

        let err = BatchError::Stage {
            stage: "scenes",
            source: StageError::Api {
                status: 502,
                message: "bad gateway".into(),
            },
        };
        assert!(err.to_string().starts_with("scenes stage failed"));
    }
}
