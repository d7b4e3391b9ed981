//! Worker pool for processing tasks from a [`TaskQueue`].
//!
//! Each worker runs as an independent async task, pulls one task at a time,
//! routes it to the handler registered for its task type and settles it:
//! completed, requeued for another attempt, or dead-lettered.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Per-task timeout taken from the task envelope
//! - Crash recovery of the processing area on start
//! - Pool statistics tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;

use super::backend::{QueueError, TaskQueue};
use super::task::{Task, TaskError, TaskResult};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Processes tasks of one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), TaskError>;

    /// Called after a failed attempt, before the task is requeued or
    /// dead-lettered. `will_retry` tells which.
    async fn on_failure(&self, _task: &Task, _error: &TaskError, _will_retry: bool) {}
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a dequeue waits before the worker re-checks for shutdown.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently processing a task.
    pub active_workers: usize,
    pub tasks_completed: u64,
    /// Failed attempts, including ones that were retried.
    pub tasks_failed: u64,
    pub average_task_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration: average,
        }
    }
}

type HandlerMap = HashMap<String, Arc<dyn TaskHandler>>;

/// Worker pool that manages multiple workers consuming one queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn TaskQueue>,
    handlers: HandlerMap,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, queue: Arc<dyn TaskQueue>) -> Self {
        // Shutdown is sent once, so a buffer of one is enough.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            handlers: HashMap::new(),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Routes tasks of `task_type` to `handler`. Takes effect on the next start.
    pub fn register_handler(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    /// Starts all workers in the pool.
    ///
    /// Tasks stranded in processing by a previous run are requeued first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.queue.recover_processing().await {
            Ok(recovered) if recovered > 0 => {
                info!(
                    queue = %self.queue.name(),
                    recovered = recovered,
                    "Recovered tasks from processing"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to recover processing tasks");
            }
        }

        let handlers = Arc::new(self.handlers.clone());
        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                handlers: Arc::clone(&handlers),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            queue = %self.queue.name(),
            num_workers = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Signals every worker to stop and waits for in-flight tasks.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers that already stopped have dropped their receivers.
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }
}

/// A single worker that processes tasks from the queue.
struct Worker {
    id: String,
    queue: Arc<dyn TaskQueue>,
    handlers: Arc<HandlerMap>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(task)) => self.process_task(task).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_task(&self, mut task: Task) {
        let start_time = Instant::now();
        task.increment_attempts();

        info!(
            worker_id = %self.id,
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts,
            "Processing task"
        );

        self.stats.increment_active();
        self.metrics.worker_busy();

        let handler = self.handlers.get(&task.task_type).cloned();
        let result = match &handler {
            Some(handler) => execute_with_timeout(Arc::clone(handler), task.clone()).await,
            None => Err(TaskError::UnknownType(task.task_type.clone())),
        };
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.metrics.worker_idle();

        match result {
            Ok(()) => {
                self.stats.record_completion(duration);
                let record = TaskResult::success(&task, &self.id, duration.as_millis() as u64);
                if let Err(e) = self.queue.complete(&task, record).await {
                    error!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        error = %e,
                        "Failed to mark task complete"
                    );
                }
                info!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    duration_ms = duration.as_millis() as u64,
                    "Task completed"
                );
            }
            Err(err) => {
                self.stats.record_failure(duration);
                let will_retry = err.is_retryable() && task.should_retry();

                if let Some(handler) = &handler {
                    handler.on_failure(&task, &err, will_retry).await;
                }

                if will_retry {
                    warn!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        error = %err,
                        remaining_attempts = task.remaining_attempts(),
                        "Task failed, requeueing for retry"
                    );
                    if let Err(e) = self.queue.requeue(task).await {
                        error!(worker_id = %self.id, error = %e, "Failed to requeue task");
                    }
                } else {
                    error!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        error = %err,
                        "Task failed, moving to dead letter queue"
                    );
                    let message = err.to_string();
                    let record =
                        TaskResult::failure(&task, &self.id, &message, duration.as_millis() as u64);
                    if let Err(e) = self.queue.complete(&task, record).await {
                        warn!(worker_id = %self.id, error = %e, "Failed to store task result");
                    }
                    if let Err(e) = self.queue.dead_letter(task, &message).await {
                        error!(
                            worker_id = %self.id,
                            error = %e,
                            "Failed to move task to dead letter queue"
                        );
                    }
                }
            }
        }
    }
}

/// Runs a handler on its own task under the task's timeout.
async fn execute_with_timeout(handler: Arc<dyn TaskHandler>, task: Task) -> Result<(), TaskError> {
    let timeout = task.timeout();
    let mut run = tokio::spawn(async move { handler.handle(&task).await });

    match tokio::time::timeout(timeout, &mut run).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(TaskError::Failed(format!("handler panicked: {}", join_error))),
        Err(_) => {
            run.abort();
            Err(TaskError::Timeout(timeout))
        }
    }
}
