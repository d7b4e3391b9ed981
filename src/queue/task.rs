//! Task envelope carried by the work queue.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default number of redeliveries after the first attempt.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Default time allowed for one attempt.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default retention of task results.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// A unit of work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    /// Routes the task to a registered handler.
    pub task_type: String,
    pub payload: serde_json::Value,
    /// Number of attempts started so far.
    pub attempts: u32,
    /// Redeliveries allowed after the first attempt.
    pub max_retry: u32,
    pub timeout_secs: u64,
    /// How long the result record is kept.
    pub retention_secs: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            attempts: 0,
            max_retry: DEFAULT_MAX_RETRY,
            timeout_secs: DEFAULT_TASK_TIMEOUT.as_secs(),
            retention_secs: DEFAULT_RETENTION.as_secs(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = retention.as_secs();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Whether a failure of the current attempt should be redelivered.
    pub fn should_retry(&self) -> bool {
        self.attempts <= self.max_retry
    }

    pub fn remaining_attempts(&self) -> u32 {
        (self.max_retry + 1).saturating_sub(self.attempts)
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// Transient failure, redelivered while retries remain.
    #[error("{0}")]
    Failed(String),

    /// The payload cannot be processed; never redelivered.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("no handler registered for task type '{0}'")]
    UnknownType(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Failed(_) | TaskError::Timeout(_))
    }
}

/// Final state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result record stored after a task settles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub task_type: String,
    pub status: TaskStatus,
    pub worker_id: String,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task: &Task, worker_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            status: TaskStatus::Completed,
            worker_id: worker_id.into(),
            attempts: task.attempts,
            error: None,
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(
        task: &Task,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            status: TaskStatus::Failed,
            worker_id: worker_id.into(),
            attempts: task.attempts,
            error: Some(error.into()),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_defaults() {
        let task = Task::new("batch:process_video", serde_json::json!({"id": 1}));
        assert_eq!(task.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(task.timeout(), Duration::from_secs(1800));
        assert_eq!(task.retention_secs, 86_400);
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn test_retry_allows_max_retry_redeliveries() {
        let mut task = Task::new("t", serde_json::Value::Null).with_max_retry(2);

        task.increment_attempts();
        assert!(task.should_retry());
        task.increment_attempts();
        assert!(task.should_retry());
        task.increment_attempts();
        assert!(!task.should_retry());
        assert_eq!(task.remaining_attempts(), 0);
    }

    #[test]
    fn test_zero_max_retry_is_single_attempt() {
        let mut task = Task::new("t", serde_json::Value::Null).with_max_retry(0);
        task.increment_attempts();
        assert!(!task.should_retry());
    }

    #[test]
    fn test_task_error_retryable() {
        assert!(TaskError::Failed("x".into()).is_retryable());
        assert!(TaskError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TaskError::InvalidPayload("x".into()).is_retryable());
        assert!(!TaskError::UnknownType("x".into()).is_retryable());
    }

    #[test]
    fn test_task_result_constructors() {
        let mut task = Task::new("t", serde_json::Value::Null);
        task.increment_attempts();

        let ok = TaskResult::success(&task, "worker-0", 120);
        assert!(ok.is_success());
        assert_eq!(ok.attempts, 1);

        let failed = TaskResult::failure(&task, "worker-0", "stage failed", 80);
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("stage failed"));
        assert_eq!(failed.status.to_string(), "failed");
    }
}
