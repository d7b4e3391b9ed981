//! Redis-based task queue with reliable dequeue.
//!
//! # Queue Structure
//!
//! - `{queue_name}`: main list; LPUSH to enqueue, BRPOPLPUSH to dequeue
//! - `{queue_name}:processing`: tasks held by workers (for crash recovery)
//! - `{queue_name}:dead_letter`: tasks that exhausted their retries
//! - `{queue_name}:results:{id}`: result records with per-task retention

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

use super::backend::{DeadLetter, QueueError, QueueStats, TaskQueue};
use super::task::{Task, TaskResult};

/// Redis-backed [`TaskQueue`].
#[derive(Clone)]
pub struct RedisTaskQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    dead_letter_queue: String,
    results_key: String,
}

impl RedisTaskQueue {
    /// Connects to Redis and creates a queue named `queue_name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
            results_key: format!("{}:results", queue_name),
        }
    }

    fn result_key(&self, task_id: Uuid) -> String {
        format!("{}:{}", self.results_key, task_id)
    }

    /// Finds the raw processing-list entry for a task id.
    async fn find_processing_entry(&self, task_id: Uuid) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        Ok(entries.into_iter().find(|raw| {
            serde_json::from_str::<Task>(raw)
                .map(|task| task.id == task_id)
                .unwrap_or(false)
        }))
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    fn name(&self) -> &str {
        &self.queue_name
    }

    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&task)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, task: &Task, result: TaskResult) -> Result<(), QueueError> {
        let result_data = serde_json::to_string(&result)?;
        let entry = self.find_processing_entry(task.id).await?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(raw) = entry {
            pipe.lrem(&self.processing_queue, 1, raw).ignore();
        }
        if task.retention_secs > 0 {
            pipe.cmd("SET")
                .arg(self.result_key(task.id))
                .arg(result_data)
                .arg("EX")
                .arg(task.retention_secs)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn requeue(&self, task: Task) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&task)?;
        let entry = self.find_processing_entry(task.id).await?;
        let mut conn = self.redis.clone();

        // RPUSH puts the task at the dequeue end for immediate retry.
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(raw) = entry {
            pipe.lrem(&self.processing_queue, 1, raw).ignore();
        }
        pipe.rpush(&self.queue_name, serialized).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn dead_letter(&self, task: Task, error: &str) -> Result<(), QueueError> {
        let entry = self.find_processing_entry(task.id).await?;
        let dead_letter = DeadLetter {
            task,
            error: error.to_string(),
            moved_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&dead_letter)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(raw) = entry {
            pipe.lrem(&self.processing_queue, 1, raw).ignore();
        }
        pipe.lpush(&self.dead_letter_queue, serialized).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn recover_processing(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        let mut recovered = 0;

        for raw in entries {
            let mut task = match serde_json::from_str::<Task>(&raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!(queue = %self.queue_name, error = %e, "Dropping undecodable processing entry");
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &raw).await?;
                    continue;
                }
            };

            // The interrupted run counts as an attempt.
            task.increment_attempts();

            if task.should_retry() {
                let serialized = serde_json::to_string(&task)?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .lrem(&self.processing_queue, 1, &raw)
                    .ignore()
                    .rpush(&self.queue_name, serialized)
                    .ignore();
                pipe.query_async::<_, ()>(&mut conn).await?;
                recovered += 1;
            } else {
                self.dead_letter(task, "recovered from processing after max attempts")
                    .await?;
            }
        }

        Ok(recovered)
    }

    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.result_key(task_id)).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<DeadLetter>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (pending, processing, dead): (usize, usize, usize) = redis::pipe()
            .llen(&self.queue_name)
            .llen(&self.processing_queue)
            .llen(&self.dead_letter_queue)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_tasks: pending,
            processing_tasks: processing,
            dead_letter_tasks: dead,
        })
    }
}
