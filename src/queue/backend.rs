//! Queue abstraction shared by the Redis and in-memory backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::task::{Task, TaskResult};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The queue refused new work.
    #[error("Queue '{0}' is closed")]
    Closed(String),
}

/// A task that exhausted its retries, with the final error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub task: Task,
    pub error: String,
    pub moved_at: DateTime<Utc>,
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    /// Tasks waiting to be picked up.
    pub pending_tasks: usize,
    /// Tasks currently held by a worker.
    pub processing_tasks: usize,
    pub dead_letter_tasks: usize,
}

impl QueueStats {
    pub fn total_tasks(&self) -> usize {
        self.pending_tasks + self.processing_tasks + self.dead_letter_tasks
    }
}

/// A reliable FIFO work queue.
///
/// Dequeued tasks sit in a processing area until the worker completes,
/// requeues or dead-letters them, so a crashed worker's task can be recovered.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Takes the next task, waiting up to `timeout`. `Ok(None)` on timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError>;

    /// Removes a task from processing and stores its result.
    async fn complete(&self, task: &Task, result: TaskResult) -> Result<(), QueueError>;

    /// Returns a task to the front of the queue for another attempt.
    async fn requeue(&self, task: Task) -> Result<(), QueueError>;

    /// Moves a task from processing to the dead letter area.
    async fn dead_letter(&self, task: Task, error: &str) -> Result<(), QueueError>;

    /// Requeues tasks left in processing by a previous run. Returns how many
    /// went back to the queue.
    async fn recover_processing(&self) -> Result<usize, QueueError>;

    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>, QueueError>;

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::Closed("batch".to_string());
        assert!(err.to_string().contains("batch"));
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            queue_name: "batch".to_string(),
            pending_tasks: 10,
            processing_tasks: 5,
            dead_letter_tasks: 2,
        };
        assert_eq!(stats.total_tasks(), 17);
    }

    #[test]
    fn test_dead_letter_entry_serializes() {
        let entry = DeadLetter {
            task: Task::new("t", serde_json::json!({"video": 1})),
            error: "stage failed".to_string(),
            moved_at: Utc::now(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("task").is_some());
        assert_eq!(value["error"], "stage failed");
        assert!(value.get("moved_at").is_some());
    }
}
