//! Durable storage for scheduler jobs.
//!
//! A store keeps every job in exactly one of four collections:
//!
//! - the due-set, ordered by run-at (status `delayed`)
//! - the working set (status `active`)
//! - the completed map
//! - the failed map
//!
//! plus individually keyed recurring definitions. Moves between collections
//! are atomic per job.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::job::{Job, JobStatus, RecurringJob};

/// Errors raised by a job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job {0} is not in the working set")]
    NotActive(Uuid),
}

/// Per-collection counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub recurring: usize,
}

impl JobStats {
    pub fn total_jobs(&self) -> usize {
        self.delayed + self.active + self.completed + self.failed
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a delayed job into the due-set keyed by its run-at.
    async fn schedule(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Moves every job with run-at <= `now` from the due-set to the working
    /// set, marks them `active` and returns them, oldest first.
    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Persists the body of a job in the working set.
    async fn update_active(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Moves a job from the working set to the completed map.
    async fn complete(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Moves a job from the working set to the failed map.
    async fn fail(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Moves a job from the working set back into the due-set.
    async fn reschedule(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Moves every job left in the working set back into the due-set.
    ///
    /// Only safe while no other scheduler is executing jobs from this store.
    async fn recover_active(&self) -> Result<usize, JobStoreError>;

    /// Looks a job up across all collections.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Inserts or replaces a recurring definition by name.
    async fn save_recurring(&self, definition: &RecurringJob) -> Result<(), JobStoreError>;

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>, JobStoreError>;

    /// Removes a recurring definition, returning whether it existed.
    async fn remove_recurring(&self, name: &str) -> Result<bool, JobStoreError>;
}

#[derive(Default)]
struct MemoryState {
    delayed: BTreeMap<(DateTime<Utc>, Uuid), Job>,
    active: HashMap<Uuid, Job>,
    completed: HashMap<Uuid, Job>,
    failed: HashMap<Uuid, Job>,
    recurring: BTreeMap<String, RecurringJob>,
}

impl MemoryState {
    fn remove_delayed(&mut self, id: Uuid) -> Option<Job> {
        let key = self.delayed.keys().find(|(_, job_id)| *job_id == id).copied()?;
        self.delayed.remove(&key)
    }

    fn insert_delayed(&mut self, job: Job) {
        let run_at = job.run_at.unwrap_or(job.created_at);
        self.delayed.insert((run_at, job.id), job);
    }
}

/// In-process job store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn schedule(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().await;
        state.remove_delayed(job.id);
        state.insert_delayed(job.clone());
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut state = self.state.lock().await;
        let due_keys: Vec<_> = state
            .delayed
            .range(..)
            .take_while(|((run_at, _), _)| *run_at <= now)
            .map(|(key, _)| *key)
            .collect();

        let mut claimed = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            if let Some(mut job) = state.delayed.remove(&key) {
                job.status = JobStatus::Active;
                state.active.insert(job.id, job.clone());
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn update_active(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().await;
        match state.active.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotActive(job.id)),
        }
    }

    async fn complete(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().await;
        state.active.remove(&job.id);
        state.completed.insert(job.id, job.clone());
        Ok(())
    }

    async fn fail(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().await;
        state.active.remove(&job.id);
        state.failed.insert(job.id, job.clone());
        Ok(())
    }

    async fn reschedule(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().await;
        state.active.remove(&job.id);
        state.insert_delayed(job.clone());
        Ok(())
    }

    async fn recover_active(&self) -> Result<usize, JobStoreError> {
        let mut state = self.state.lock().await;
        let stranded: Vec<Job> = state.active.drain().map(|(_, job)| job).collect();
        let count = stranded.len();
        for mut job in stranded {
            job.status = JobStatus::Delayed;
            state.insert_delayed(job);
        }
        Ok(count)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        let state = self.state.lock().await;
        let found = state
            .delayed
            .values()
            .find(|job| job.id == id)
            .or_else(|| state.active.get(&id))
            .or_else(|| state.completed.get(&id))
            .or_else(|| state.failed.get(&id))
            .cloned();
        Ok(found)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.state.lock().await;
        Ok(JobStats {
            delayed: state.delayed.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            recurring: state.recurring.len(),
        })
    }

    async fn save_recurring(&self, definition: &RecurringJob) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().await;
        state
            .recurring
            .insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>, JobStoreError> {
        let state = self.state.lock().await;
        Ok(state.recurring.values().cloned().collect())
    }

    async fn remove_recurring(&self, name: &str) -> Result<bool, JobStoreError> {
        let mut state = self.state.lock().await;
        Ok(state.recurring.remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::RecurringRule;
    use chrono::Duration;

    fn job_at(run_at: DateTime<Utc>) -> Job {
        Job::new("noop", serde_json::Value::Null).with_run_at(run_at)
    }

    #[tokio::test]
    async fn test_claim_due_only_takes_due_jobs() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let due = job_at(now - Duration::seconds(5));
        let later = job_at(now + Duration::minutes(5));
        store.schedule(&due).await.unwrap();
        store.schedule(&later).await.unwrap();

        let claimed = store.claim_due(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn test_claim_due_orders_by_run_at() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let second = job_at(now - Duration::seconds(1));
        let first = job_at(now - Duration::seconds(10));
        store.schedule(&second).await.unwrap();
        store.schedule(&first).await.unwrap();

        let claimed = store.claim_due(now).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_job_lives_in_exactly_one_collection() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let mut job = job_at(now);
        store.schedule(&job).await.unwrap();
        store.claim_due(now).await.unwrap();

        job.status = JobStatus::Delayed;
        job.run_at = Some(now + Duration::seconds(30));
        store.reschedule(&job).await.unwrap();
        assert_eq!(store.stats().await.unwrap().total_jobs(), 1);

        store.claim_due(now + Duration::minutes(1)).await.unwrap();
        job.status = JobStatus::Completed;
        store.complete(&job).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_jobs(), 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(
            store.get(job.id).await.unwrap().map(|j| j.status),
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_claimed_job_reports_active() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = job_at(now);
        store.schedule(&job).await.unwrap();

        let claimed = store.claim_due(now).await.unwrap();
        assert_eq!(claimed[0].status, JobStatus::Active);
        assert_eq!(
            store.get(job.id).await.unwrap().map(|j| j.status),
            Some(JobStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_recover_active_returns_jobs_to_due_set() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = job_at(now - Duration::seconds(30));
        store.schedule(&job).await.unwrap();
        store.claim_due(now).await.unwrap();

        assert_eq!(store.recover_active().await.unwrap(), 1);
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.delayed, stats.active), (1, 0));
        assert_eq!(
            store.get(job.id).await.unwrap().map(|j| j.status),
            Some(JobStatus::Delayed)
        );

        let reclaimed = store.claim_due(now).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job.id);
        assert_eq!(store.recover_active().await.unwrap(), 1);
        assert_eq!(store.recover_active().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_active_requires_working_set() {
        let store = MemoryJobStore::new();
        let job = job_at(Utc::now());
        let err = store.update_active(&job).await.unwrap_err();
        assert!(matches!(err, JobStoreError::NotActive(id) if id == job.id));
    }

    #[tokio::test]
    async fn test_recurring_definitions_keyed_by_name() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let mut def = RecurringJob::new(
            "digest",
            "noop",
            serde_json::Value::Null,
            RecurringRule::daily(),
            now,
        );
        store.save_recurring(&def).await.unwrap();
        def.last_run = now + Duration::days(1);
        store.save_recurring(&def).await.unwrap();

        let defs = store.list_recurring().await.unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].last_run, def.last_run);

        assert!(store.remove_recurring("digest").await.unwrap());
        assert!(!store.remove_recurring("digest").await.unwrap());
    }
}
