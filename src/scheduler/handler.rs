//! Job handler trait and error type.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::job::Job;

/// Failure returned by a job handler.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    /// Transient failure, retried while budget remains.
    #[error("{0}")]
    Failed(String),

    /// Failure that retrying cannot fix (bad payload, missing handler, auth).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The handler did not finish within the job timeout.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(message.into())
    }

    /// Whether the scheduler may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Permanent(_))
    }
}

/// Executes jobs registered under a handler name.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// Called once when a job fails for the last time.
    async fn on_exhausted(&self, _job: &Job, _error: &JobError) {}
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new<Fut>(func: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), JobError>> + Send,
    {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        (self.func)(job.clone()).await
    }
}
