//! Redis-backed job store.
//!
//! # Key layout
//!
//! - `{prefix}:delayed`: sorted set of job ids scored by run-at (epoch seconds)
//! - `{prefix}:jobs`: hash of job bodies for delayed and active jobs
//! - `{prefix}:active`: set of job ids in the working set
//! - `{prefix}:completed` / `{prefix}:failed`: hashes of terminal job bodies
//! - `{prefix}:recurring:{name}`: recurring definition bodies
//! - `{prefix}:recurring`: set of recurring definition names
//!
//! Every move between collections runs as a MULTI/EXEC pipeline, and claiming
//! due jobs runs as a single Lua script, so a job id is never visible in two
//! collections at once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

use super::job::{Job, JobStatus, RecurringJob};
use super::store::{JobStats, JobStore, JobStoreError};

const CLAIM_DUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local bodies = {}
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('SADD', KEYS[2], id)
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    table.insert(bodies, body)
  end
end
return bodies
"#;

fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Job store over a shared Redis connection.
#[derive(Clone)]
pub struct RedisJobStore {
    redis: ConnectionManager,
    delayed_key: String,
    jobs_key: String,
    active_key: String,
    completed_key: String,
    failed_key: String,
    recurring_index_key: String,
    prefix: String,
}

impl RedisJobStore {
    /// Connects to Redis and creates a store rooted at `prefix`.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| JobStoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| JobStoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            delayed_key: format!("{}:delayed", prefix),
            jobs_key: format!("{}:jobs", prefix),
            active_key: format!("{}:active", prefix),
            completed_key: format!("{}:completed", prefix),
            failed_key: format!("{}:failed", prefix),
            recurring_index_key: format!("{}:recurring", prefix),
            prefix: prefix.to_string(),
        }
    }

    fn recurring_key(&self, name: &str) -> String {
        format!("{}:recurring:{}", self.prefix, name)
    }

    /// Moves a job out of the working set into a terminal hash.
    async fn settle(&self, job: &Job, target_key: &str) -> Result<(), JobStoreError> {
        let id = job.id.to_string();
        let body = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(&self.active_key, &id)
            .ignore()
            .hdel(&self.jobs_key, &id)
            .ignore()
            .hset(target_key, &id, body)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn schedule(&self, job: &Job) -> Result<(), JobStoreError> {
        let id = job.id.to_string();
        let body = serde_json::to_string(job)?;
        let run_at = job.run_at.unwrap_or(job.created_at);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.jobs_key, &id, body)
            .ignore()
            .zadd(&self.delayed_key, &id, score(run_at))
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut conn = self.redis.clone();
        let bodies: Vec<String> = redis::Script::new(CLAIM_DUE_SCRIPT)
            .key(&self.delayed_key)
            .key(&self.active_key)
            .key(&self.jobs_key)
            .arg(score(now))
            .invoke_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(bodies.len());
        let mut pipe = redis::pipe();
        for body in bodies {
            match serde_json::from_str::<Job>(&body) {
                Ok(mut job) => {
                    job.status = JobStatus::Active;
                    pipe.hset(&self.jobs_key, job.id.to_string(), serde_json::to_string(&job)?)
                        .ignore();
                    jobs.push(job);
                }
                Err(e) => warn!(error = %e, "Skipping undecodable job body"),
            }
        }
        if !jobs.is_empty() {
            pipe.query_async::<_, ()>(&mut conn).await?;
        }
        Ok(jobs)
    }

    async fn update_active(&self, job: &Job) -> Result<(), JobStoreError> {
        let id = job.id.to_string();
        let mut conn = self.redis.clone();
        let is_active: bool = conn.sismember(&self.active_key, &id).await?;
        if !is_active {
            return Err(JobStoreError::NotActive(job.id));
        }
        let body = serde_json::to_string(job)?;
        conn.hset::<_, _, _, ()>(&self.jobs_key, &id, body).await?;
        Ok(())
    }

    async fn complete(&self, job: &Job) -> Result<(), JobStoreError> {
        self.settle(job, &self.completed_key).await
    }

    async fn fail(&self, job: &Job) -> Result<(), JobStoreError> {
        self.settle(job, &self.failed_key).await
    }

    async fn reschedule(&self, job: &Job) -> Result<(), JobStoreError> {
        let id = job.id.to_string();
        let body = serde_json::to_string(job)?;
        let run_at = job.run_at.unwrap_or_else(Utc::now);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(&self.active_key, &id)
            .ignore()
            .hset(&self.jobs_key, &id, body)
            .ignore()
            .zadd(&self.delayed_key, &id, score(run_at))
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn recover_active(&self) -> Result<usize, JobStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(&self.active_key).await?;

        let mut recovered = 0;
        for id in ids {
            let body: Option<String> = conn.hget(&self.jobs_key, &id).await?;
            let Some(body) = body else {
                warn!(job_id = %id, "Working set points at a missing job body");
                conn.srem::<_, _, ()>(&self.active_key, &id).await?;
                continue;
            };
            let mut job: Job = serde_json::from_str(&body)?;
            job.status = JobStatus::Delayed;
            self.reschedule(&job).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        let id = id.to_string();
        let mut conn = self.redis.clone();

        for key in [&self.jobs_key, &self.completed_key, &self.failed_key] {
            let body: Option<String> = conn.hget(key, &id).await?;
            if let Some(body) = body {
                return Ok(Some(serde_json::from_str(&body)?));
            }
        }
        Ok(None)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut conn = self.redis.clone();
        let (delayed, active, completed, failed, recurring): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcard(&self.delayed_key)
                .scard(&self.active_key)
                .hlen(&self.completed_key)
                .hlen(&self.failed_key)
                .scard(&self.recurring_index_key)
                .query_async(&mut conn)
                .await?;

        Ok(JobStats {
            delayed,
            active,
            completed,
            failed,
            recurring,
        })
    }

    async fn save_recurring(&self, definition: &RecurringJob) -> Result<(), JobStoreError> {
        let body = serde_json::to_string(definition)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.recurring_key(&definition.name), body)
            .ignore()
            .sadd(&self.recurring_index_key, &definition.name)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>, JobStoreError> {
        let mut conn = self.redis.clone();
        let mut names: Vec<String> = conn.smembers(&self.recurring_index_key).await?;
        names.sort();

        let mut definitions = Vec::with_capacity(names.len());
        for name in names {
            let body: Option<String> = conn.get(self.recurring_key(&name)).await?;
            match body {
                Some(body) => definitions.push(serde_json::from_str(&body)?),
                None => warn!(name = %name, "Recurring index points at a missing definition"),
            }
        }
        Ok(definitions)
    }

    async fn remove_recurring(&self, name: &str) -> Result<bool, JobStoreError> {
        let mut conn = self.redis.clone();
        let (deleted, _): (usize, usize) = redis::pipe()
            .atomic()
            .del(self.recurring_key(name))
            .srem(&self.recurring_index_key, name)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}
