//! In-process task queue for tests and single-node runs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::backend::{DeadLetter, QueueError, QueueStats, TaskQueue};
use super::task::{Task, TaskResult};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    processing: HashMap<Uuid, Task>,
    dead_letter: Vec<DeadLetter>,
    results: HashMap<Uuid, (TaskResult, DateTime<Utc>)>,
}

/// A [`TaskQueue`] backed by in-memory collections.
pub struct MemoryTaskQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Notify,
}

impl MemoryTaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    /// Snapshot of the pending tasks in dequeue order.
    pub async fn pending(&self) -> Vec<Task> {
        self.state.lock().await.pending.iter().cloned().collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.state.lock().await.pending.push_back(task);
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(task) = state.pending.pop_front() {
                    state.processing.insert(task.id, task.clone());
                    return Ok(Some(task));
                }
            }

            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, task: &Task, result: TaskResult) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.processing.remove(&task.id);
        if task.retention_secs > 0 {
            let retention = chrono::Duration::seconds(task.retention_secs.min(u32::MAX as u64) as i64);
            let expires_at = Utc::now() + retention;
            state.results.insert(task.id, (result, expires_at));
        }
        Ok(())
    }

    async fn requeue(&self, task: Task) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.processing.remove(&task.id);
            state.pending.push_front(task);
        }
        self.available.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, task: Task, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.processing.remove(&task.id);
        state.dead_letter.insert(
            0,
            DeadLetter {
                task,
                error: error.to_string(),
                moved_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn recover_processing(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let stranded: Vec<Task> = state.processing.drain().map(|(_, task)| task).collect();
        let mut recovered = 0;

        for mut task in stranded {
            task.increment_attempts();
            if task.should_retry() {
                state.pending.push_back(task);
                recovered += 1;
            } else {
                state.dead_letter.insert(
                    0,
                    DeadLetter {
                        task,
                        error: "recovered from processing after max attempts".to_string(),
                        moved_at: Utc::now(),
                    },
                );
            }
        }

        drop(state);
        for _ in 0..recovered {
            self.available.notify_one();
        }
        Ok(recovered)
    }

    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .results
            .get(&task_id)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(result, _)| result.clone()))
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead_letter.iter().take(limit).cloned().collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            queue_name: self.name.clone(),
            pending_tasks: state.pending.len(),
            processing_tasks: state.processing.len(),
            dead_letter_tasks: state.dead_letter.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task(n: u32) -> Task {
        Task::new("t", serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_fifo_order_and_processing() {
        let queue = MemoryTaskQueue::new("batch");
        queue.enqueue(task(1)).await.unwrap();
        queue.enqueue(task(2)).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.payload["n"], 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending_tasks, 1);
        assert_eq!(stats.processing_tasks, 1);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let queue = MemoryTaskQueue::new("batch");
        let got = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryTaskQueue::new("batch"));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(task(7)).await.unwrap();

        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.payload["n"], 7);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_front() {
        let queue = MemoryTaskQueue::new("batch");
        queue.enqueue(task(1)).await.unwrap();
        queue.enqueue(task(2)).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        queue.requeue(first.clone()).await.unwrap();

        let again = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_complete_stores_result() {
        let queue = MemoryTaskQueue::new("batch");
        queue.enqueue(task(1)).await.unwrap();
        let mut t = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        t.increment_attempts();

        queue
            .complete(&t, TaskResult::success(&t, "worker-0", 5))
            .await
            .unwrap();

        assert_eq!(queue.stats().await.unwrap().processing_tasks, 0);
        let result = queue.get_result(t.id).await.unwrap().unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_recover_processing_respects_budget() {
        let queue = MemoryTaskQueue::new("batch");
        queue.enqueue(task(1)).await.unwrap();
        queue
            .enqueue(task(2).with_max_retry(0))
            .await
            .unwrap();
        queue.dequeue(Duration::from_millis(10)).await.unwrap();
        queue.dequeue(Duration::from_millis(10)).await.unwrap();

        let recovered = queue.recover_processing().await.unwrap();
        assert_eq!(recovered, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending_tasks, 1);
        assert_eq!(stats.dead_letter_tasks, 1);
        assert_eq!(stats.processing_tasks, 0);

        let dead = queue.peek_dead_letter(10).await.unwrap();
        assert_eq!(dead[0].task.payload["n"], 2);
    }
}
