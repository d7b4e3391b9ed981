//! The scheduler: promotes due jobs, runs handlers, retries with backoff and
//! expands recurring definitions.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::metrics::MetricsCollector;

use super::handler::{JobError, JobHandler};
use super::job::{Job, JobStatus, RecurringJob, RecurringRule, DEFAULT_MAX_RETRIES};
use super::store::{JobStats, JobStore, JobStoreError};

/// Errors returned by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between ticks.
    pub poll_interval: Duration,
    /// Maximum time a single handler invocation may run.
    pub job_timeout: Duration,
    /// Retry delay unit; attempt `n` is retried after `n` units.
    pub retry_backoff: Duration,
    /// Maximum number of jobs executing at once.
    pub max_concurrent_jobs: usize,
    /// How long shutdown waits for executing jobs.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(60),
            max_concurrent_jobs: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Due jobs moved to the working set and dispatched.
    pub dispatched: usize,
    /// Concrete jobs created from recurring definitions.
    pub recurring_enqueued: usize,
}

/// Owned scheduler instance. Share it behind an `Arc`.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            store,
            handlers: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            config,
            permits,
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Associates a job-type name with a handler, replacing any previous one.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        debug!(handler = %name, "Registering job handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, handler);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Adds a job to the due-set and returns it as stored.
    ///
    /// Run-at defaults to now plus the job's delay. Never waits for execution.
    pub async fn add_job(&self, mut job: Job) -> Result<Job, SchedulerError> {
        if job.handler.trim().is_empty() {
            return Err(SchedulerError::InvalidJob(
                "handler name must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        if job.run_at.is_none() {
            let delay = chrono::Duration::seconds(i64::try_from(job.delay_secs).unwrap_or(i64::MAX));
            job.run_at = Some(now.checked_add_signed(delay).unwrap_or(now));
        }
        if job.max_retries == 0 {
            job.max_retries = DEFAULT_MAX_RETRIES;
        }
        job.status = JobStatus::Delayed;
        job.created_at = now;
        job.updated_at = now;

        self.store.schedule(&job).await?;
        debug!(
            job_id = %job.id,
            handler = %job.handler,
            run_at = ?job.run_at,
            "Job scheduled"
        );
        Ok(job)
    }

    /// Stores a recurring definition with `last_run = now`. No job is created
    /// until the first occurrence comes due.
    pub async fn add_recurring_job(
        &self,
        name: impl Into<String>,
        handler: impl Into<String>,
        payload: serde_json::Value,
        rule: RecurringRule,
    ) -> Result<RecurringJob, SchedulerError> {
        let now = self.clock.now();
        self.add_recurring_job_from(name, handler, payload, rule, now)
            .await
    }

    /// Stores a recurring definition whose series is anchored at `last_run`.
    pub async fn add_recurring_job_from(
        &self,
        name: impl Into<String>,
        handler: impl Into<String>,
        payload: serde_json::Value,
        rule: RecurringRule,
        last_run: DateTime<Utc>,
    ) -> Result<RecurringJob, SchedulerError> {
        let definition = RecurringJob::new(name, handler, payload, rule, last_run);
        if definition.name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob(
                "recurring job name must not be empty".to_string(),
            ));
        }
        self.store.save_recurring(&definition).await?;
        info!(
            name = %definition.name,
            handler = %definition.handler,
            frequency = %definition.rule.frequency,
            interval = definition.rule.interval,
            "Recurring job registered"
        );
        Ok(definition)
    }

    pub async fn remove_recurring_job(&self, name: &str) -> Result<bool, SchedulerError> {
        Ok(self.store.remove_recurring(name).await?)
    }

    pub async fn list_recurring_jobs(&self) -> Result<Vec<RecurringJob>, SchedulerError> {
        Ok(self.store.list_recurring().await?)
    }

    /// Looks a job up in every collection.
    pub async fn get_job_status(&self, id: Uuid) -> Result<Option<Job>, SchedulerError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn get_queue_stats(&self) -> Result<JobStats, SchedulerError> {
        Ok(self.store.stats().await?)
    }

    /// Returns jobs stranded in the working set by a stopped instance to the
    /// due-set. Run once before this instance starts ticking.
    pub async fn recover_active_jobs(&self) -> Result<usize, SchedulerError> {
        let recovered = self.store.recover_active().await?;
        if recovered > 0 {
            warn!(recovered, "Recovered jobs left active by a previous run");
        }
        Ok(recovered)
    }

    /// Runs one loop iteration: dispatches due jobs, then expands recurring
    /// definitions. Dispatched jobs keep running after this returns.
    pub async fn tick(self: &Arc<Self>) -> Result<TickReport, SchedulerError> {
        let (report, _handles) = self.tick_inner().await?;
        Ok(report)
    }

    /// Like [`Scheduler::tick`] but waits for every dispatched job to finish.
    pub async fn run_pending(self: &Arc<Self>) -> Result<TickReport, SchedulerError> {
        let (report, handles) = self.tick_inner().await?;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Job execution task failed");
            }
        }
        Ok(report)
    }

    async fn tick_inner(self: &Arc<Self>) -> Result<(TickReport, Vec<JoinHandle<()>>), SchedulerError> {
        let now = self.clock.now();
        let due = self.store.claim_due(now).await?;
        let dispatched = due.len();

        let mut handles = Vec::with_capacity(due.len());
        for job in due {
            // Waiting here is the loop's backpressure when every slot is busy.
            let permit = Arc::clone(&self.permits).acquire_owned().await.ok();
            let scheduler = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                scheduler.execute(job).await;
            }));
        }

        let recurring_enqueued = self.expand_recurring(now).await?;

        Ok((
            TickReport {
                dispatched,
                recurring_enqueued,
            },
            handles,
        ))
    }

    /// Turns every passed occurrence of every recurring definition into a job.
    async fn expand_recurring(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let mut enqueued = 0;
        for mut definition in self.store.list_recurring().await? {
            for occurrence in definition.due_occurrences(now) {
                let job = Job::new(definition.handler.clone(), definition.payload.clone())
                    .with_run_at(occurrence)
                    .with_occurrence(occurrence);
                let job = self.add_job(job).await?;

                definition.last_run = occurrence;
                self.store.save_recurring(&definition).await?;
                enqueued += 1;

                debug!(
                    name = %definition.name,
                    job_id = %job.id,
                    occurrence = %occurrence,
                    "Recurring occurrence enqueued"
                );
            }
        }
        Ok(enqueued)
    }

    /// Long-running loop. Ticks every `poll_interval` until `cancel` fires,
    /// then waits up to `shutdown_timeout` for executing jobs.
    pub async fn process_jobs(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Scheduler started"
        );

        if let Err(e) = self.recover_active_jobs().await {
            error!(error = %e, "Failed to recover active jobs");
        }

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick_inner().await {
                        Ok((report, handles)) => {
                            if report.dispatched > 0 || report.recurring_enqueued > 0 {
                                debug!(
                                    dispatched = report.dispatched,
                                    recurring_enqueued = report.recurring_enqueued,
                                    "Scheduler tick"
                                );
                            }
                            in_flight.extend(handles);
                        }
                        Err(e) => error!(error = %e, "Scheduler tick failed"),
                    }
                    in_flight.retain(|handle| !handle.is_finished());

                    if let Ok(stats) = self.store.stats().await {
                        self.metrics.set_queue_depth("scheduler:delayed", stats.delayed);
                        self.metrics.set_queue_depth("scheduler:active", stats.active);
                    }
                }
            }
        }

        in_flight.retain(|handle| !handle.is_finished());
        if !in_flight.is_empty() {
            info!(jobs = in_flight.len(), "Waiting for executing jobs");
            let drained = tokio::time::timeout(
                self.config.shutdown_timeout,
                futures::future::join_all(in_flight),
            )
            .await;
            if drained.is_err() {
                warn!(
                    timeout_secs = self.config.shutdown_timeout.as_secs(),
                    "Shutdown timeout reached, unfinished jobs stay active until recovered"
                );
            }
        }

        info!("Scheduler stopped");
    }

    /// Executes one attempt of a job taken from the working set.
    async fn execute(&self, mut job: Job) {
        let started = Instant::now();
        job.attempts += 1;
        job.status = JobStatus::Active;
        job.updated_at = self.clock.now();

        if let Err(e) = self.store.update_active(&job).await {
            warn!(job_id = %job.id, error = %e, "Failed to persist active job");
        }

        info!(
            job_id = %job.id,
            handler = %job.handler,
            attempt = job.attempts,
            max_retries = job.max_retries,
            "Executing job"
        );

        let handler = self.handler(&job.handler);
        self.metrics.job_started();
        let result = match &handler {
            Some(handler) => self.run_handler(Arc::clone(handler), job.clone()).await,
            None => Err(JobError::permanent("no handler registered")),
        };
        self.metrics.job_finished();

        let duration = started.elapsed();
        let now = self.clock.now();
        job.updated_at = now;

        match result {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.last_error = None;
                self.metrics
                    .record_job(&job.handler, "completed", duration.as_secs_f64());

                if let Err(e) = self.store.complete(&job).await {
                    error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }
                info!(
                    job_id = %job.id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
            }
            Err(err) if err.is_retryable() && job.should_retry() => {
                let backoff = self.config.retry_backoff * job.attempts;
                let backoff = chrono::Duration::from_std(backoff)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                job.run_at = Some(now.checked_add_signed(backoff).unwrap_or(now));
                job.status = JobStatus::Delayed;
                job.last_error = Some(err.to_string());
                self.metrics
                    .record_job(&job.handler, "retried", duration.as_secs_f64());

                warn!(
                    job_id = %job.id,
                    error = %err,
                    remaining_attempts = job.remaining_attempts(),
                    run_at = ?job.run_at,
                    "Job failed, rescheduling"
                );
                if let Err(e) = self.store.reschedule(&job).await {
                    error!(job_id = %job.id, error = %e, "Failed to reschedule job");
                }
            }
            Err(err) => {
                job.status = JobStatus::Failed;
                job.last_error = Some(err.to_string());
                self.metrics
                    .record_job(&job.handler, "failed", duration.as_secs_f64());

                error!(
                    job_id = %job.id,
                    handler = %job.handler,
                    attempts = job.attempts,
                    error = %err,
                    "Job failed permanently"
                );
                if let Err(e) = self.store.fail(&job).await {
                    error!(job_id = %job.id, error = %e, "Failed to mark job failed");
                }
                if let Some(handler) = handler {
                    handler.on_exhausted(&job, &err).await;
                }
            }
        }
    }

    /// Runs the handler on its own task so panics and timeouts become errors.
    async fn run_handler(&self, handler: Arc<dyn JobHandler>, job: Job) -> Result<(), JobError> {
        let mut task = tokio::spawn(async move { handler.handle(&job).await });

        match tokio::time::timeout(self.config.job_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(JobError::Panicked(panic_message(join_error))),
            Err(_) => {
                task.abort();
                Err(JobError::Timeout(self.config.job_timeout))
            }
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::handler::FnHandler;
    use crate::scheduler::store::MemoryJobStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn scheduler_with_clock() -> (Arc<Scheduler>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let config = SchedulerConfig::default()
            .with_retry_backoff(Duration::from_secs(10))
            .with_job_timeout(Duration::from_millis(200));
        let scheduler = Scheduler::new(Arc::new(MemoryJobStore::new()), config)
            .with_clock(clock.clone());
        (Arc::new(scheduler), clock)
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert_eq!(config.max_concurrent_jobs, 10);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::default()
            .with_poll_interval(Duration::from_millis(250))
            .with_job_timeout(Duration::from_secs(30))
            .with_retry_backoff(Duration::from_secs(5))
            .with_max_concurrent_jobs(0);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_jobs, 1);
    }

    #[tokio::test]
    async fn test_add_job_assigns_run_at_from_delay() {
        let (scheduler, _clock) = scheduler_with_clock();
        let job = Job::new("noop", serde_json::Value::Null).with_delay(Duration::from_secs(90));

        let stored = scheduler.add_job(job).await.unwrap();
        assert_eq!(stored.run_at, Some(start() + chrono::Duration::seconds(90)));
        assert_eq!(stored.status, JobStatus::Delayed);
        assert_eq!(scheduler.get_queue_stats().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_add_job_rejects_empty_handler() {
        let (scheduler, _clock) = scheduler_with_clock();
        let err = scheduler
            .add_job(Job::new("  ", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJob(_)));
    }

    #[tokio::test]
    async fn test_job_not_due_is_not_dispatched() {
        let (scheduler, _clock) = scheduler_with_clock();
        scheduler
            .add_job(Job::new("noop", serde_json::Value::Null).with_delay(Duration::from_secs(60)))
            .await
            .unwrap();

        let report = scheduler.run_pending().await.unwrap();
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn test_successful_job_completes() {
        let (scheduler, _clock) = scheduler_with_clock();
        scheduler.register_handler("noop", Arc::new(FnHandler::new(|_job: Job| async { Ok(()) })));
        let job = scheduler
            .add_job(Job::new("noop", serde_json::Value::Null))
            .await
            .unwrap();

        let report = scheduler.run_pending().await.unwrap();
        assert_eq!(report.dispatched, 1);

        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_unregistered_handler_fails_without_retry() {
        let (scheduler, _clock) = scheduler_with_clock();
        let job = scheduler
            .add_job(Job::new("missing", serde_json::Value::Null))
            .await
            .unwrap();

        scheduler.run_pending().await.unwrap();

        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert!(stored
            .last_error
            .unwrap_or_default()
            .contains("no handler registered"));
    }

    #[tokio::test]
    async fn test_failure_backs_off_linearly() {
        let (scheduler, clock) = scheduler_with_clock();
        scheduler.register_handler(
            "flaky",
            Arc::new(FnHandler::new(|_job: Job| async {
                Err(JobError::failed("upstream 503"))
            })),
        );
        let job = scheduler
            .add_job(Job::new("flaky", serde_json::Value::Null))
            .await
            .unwrap();

        scheduler.run_pending().await.unwrap();
        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Delayed);
        assert_eq!(stored.run_at, Some(start() + chrono::Duration::seconds(10)));

        clock.advance(chrono::Duration::seconds(10));
        scheduler.run_pending().await.unwrap();
        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(
            stored.run_at,
            Some(start() + chrono::Duration::seconds(10 + 20))
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (scheduler, _clock) = scheduler_with_clock();
        scheduler.register_handler(
            "slow",
            Arc::new(FnHandler::new(|_job: Job| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })),
        );
        let job = scheduler
            .add_job(Job::new("slow", serde_json::Value::Null).with_max_retries(1))
            .await
            .unwrap();

        scheduler.run_pending().await.unwrap();
        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let (scheduler, _clock) = scheduler_with_clock();
        scheduler.register_handler(
            "boom",
            Arc::new(FnHandler::new(|_job: Job| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(())
            })),
        );
        let job = scheduler
            .add_job(Job::new("boom", serde_json::Value::Null).with_max_retries(1))
            .await
            .unwrap();

        scheduler.run_pending().await.unwrap();
        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored
            .last_error
            .unwrap_or_default()
            .contains("handler exploded"));
    }

    struct CountingHandler {
        exhausted: AtomicU32,
    }

    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            Err(JobError::permanent("bad payload"))
        }

        async fn on_exhausted(&self, _job: &Job, _error: &JobError) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_permanent_error_skips_retry_and_runs_hook() {
        let (scheduler, _clock) = scheduler_with_clock();
        let handler = Arc::new(CountingHandler {
            exhausted: AtomicU32::new(0),
        });
        scheduler.register_handler("strict", handler.clone());
        let job = scheduler
            .add_job(Job::new("strict", serde_json::Value::Null))
            .await
            .unwrap();

        scheduler.run_pending().await.unwrap();

        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recurring_definition_creates_no_job_until_due() {
        let (scheduler, clock) = scheduler_with_clock();
        scheduler
            .add_recurring_job("digest", "noop", serde_json::Value::Null, RecurringRule::daily())
            .await
            .unwrap();

        let report = scheduler.run_pending().await.unwrap();
        assert_eq!(report.recurring_enqueued, 0);

        clock.advance(chrono::Duration::hours(24));
        let report = scheduler.run_pending().await.unwrap();
        assert_eq!(report.recurring_enqueued, 1);

        let stats = scheduler.get_queue_stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.recurring, 1);
    }

    #[tokio::test]
    async fn test_process_jobs_stops_on_cancel() {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = Arc::new(Scheduler::new(
            store,
            SchedulerConfig::default().with_poll_interval(Duration::from_millis(10)),
        ));
        let counter = Arc::new(AtomicU32::new(0));
        let seen = counter.clone();
        scheduler.register_handler(
            "count",
            Arc::new(FnHandler::new(move |_job: Job| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
        );
        scheduler
            .add_job(Job::new("count", serde_json::Value::Null))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(Arc::clone(&scheduler).process_jobs(cancel.clone()));

        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        loop_handle.await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_jobs_runs_jobs_stranded_by_previous_instance() {
        let store = Arc::new(MemoryJobStore::new());
        let job = Job::new("count", serde_json::Value::Null).with_run_at(Utc::now());
        store.schedule(&job).await.unwrap();
        // A previous instance claimed the job and died before running it.
        store.claim_due(Utc::now()).await.unwrap();

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            SchedulerConfig::default().with_poll_interval(Duration::from_millis(10)),
        ));
        let counter = Arc::new(AtomicU32::new(0));
        let seen = counter.clone();
        scheduler.register_handler(
            "count",
            Arc::new(FnHandler::new(move |_job: Job| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
        );

        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(Arc::clone(&scheduler).process_jobs(cancel.clone()));
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        loop_handle.await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_executing_jobs() {
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(MemoryJobStore::new()),
            SchedulerConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_shutdown_timeout(Duration::from_secs(5)),
        ));
        let started = Arc::new(AtomicU32::new(0));
        let seen = started.clone();
        scheduler.register_handler(
            "slow",
            Arc::new(FnHandler::new(move |_job: Job| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            })),
        );
        let job = scheduler
            .add_job(Job::new("slow", serde_json::Value::Null))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(Arc::clone(&scheduler).process_jobs(cancel.clone()));
        for _ in 0..100 {
            if started.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        loop_handle.await.unwrap();

        let stored = scheduler.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(scheduler.get_queue_stats().await.unwrap().active, 0);
    }
}
