//! Process configuration.
//!
//! [`AppConfig`] gathers the connection strings and tuning knobs of the
//! scheduler, the batch worker pool and the two HTTP gateways. Values come
//! from defaults, then environment variables, then builder overrides.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::batch::OrchestratorConfig;
use crate::publisher::Platform;
use crate::queue::task::{DEFAULT_MAX_RETRY, DEFAULT_TASK_TIMEOUT};
use crate::queue::WorkerPoolConfig;
use crate::scheduler::SchedulerConfig;

/// Errors that can occur while building configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Connections
    pub redis_url: String,
    /// Postgres URL. Without it the worker keeps records in memory.
    pub database_url: Option<String>,
    /// Prefix of every scheduler key in Redis.
    pub key_prefix: String,

    // Scheduler
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_concurrent_jobs: usize,

    // Batch pipeline
    pub batch_queue_name: String,
    pub batch_workers: usize,
    pub batch_task_timeout: Duration,
    pub batch_max_retry: u32,

    // Gateways
    pub generation_api_base: Option<String>,
    pub generation_api_key: Option<String>,
    pub platform_api_base: Option<String>,
    pub platform_api_key: Option<String>,
    /// Platforms served through the platform gateway; empty means all.
    pub platforms: Vec<Platform>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: None,
            key_prefix: "reelcast".to_string(),

            poll_interval: scheduler.poll_interval,
            job_timeout: scheduler.job_timeout,
            retry_backoff: scheduler.retry_backoff,
            max_concurrent_jobs: scheduler.max_concurrent_jobs,

            batch_queue_name: "reelcast:batch_videos".to_string(),
            batch_workers: 4,
            batch_task_timeout: DEFAULT_TASK_TIMEOUT,
            batch_max_retry: DEFAULT_MAX_RETRY,

            generation_api_base: None,
            generation_api_key: None,
            platform_api_base: None,
            platform_api_key: None,
            platforms: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379)
    /// - `DATABASE_URL`: Postgres connection URL (optional)
    /// - `REELCAST_KEY_PREFIX`: Scheduler key prefix (default: reelcast)
    /// - `SCHEDULER_POLL_INTERVAL_MS`: Tick interval (default: 1000)
    /// - `SCHEDULER_JOB_TIMEOUT_SECS`: Handler timeout (default: 300)
    /// - `SCHEDULER_RETRY_BACKOFF_SECS`: Retry delay unit (default: 60)
    /// - `SCHEDULER_MAX_CONCURRENT_JOBS`: Concurrent handlers (default: 10)
    /// - `BATCH_QUEUE_NAME`: Task queue name (default: reelcast:batch_videos)
    /// - `BATCH_WORKERS`: Worker pool size (default: 4)
    /// - `BATCH_TASK_TIMEOUT_SECS`: Per-video timeout (default: 1800)
    /// - `BATCH_MAX_RETRY`: Redeliveries per video (default: 3)
    /// - `GENERATION_API_BASE` / `GENERATION_API_KEY`: generation gateway
    /// - `PLATFORM_API_BASE` / `PLATFORM_API_KEY`: platform gateway
    /// - `PLATFORMS`: Comma-separated platform names (default: all)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }
        config.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(val) = lookup("REELCAST_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Some(val) = lookup("SCHEDULER_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "SCHEDULER_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("SCHEDULER_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SCHEDULER_JOB_TIMEOUT_SECS")?;
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("SCHEDULER_RETRY_BACKOFF_SECS") {
            let secs: u64 = parse_env_value(&val, "SCHEDULER_RETRY_BACKOFF_SECS")?;
            config.retry_backoff = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("SCHEDULER_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse_env_value(&val, "SCHEDULER_MAX_CONCURRENT_JOBS")?;
        }

        if let Some(val) = lookup("BATCH_QUEUE_NAME") {
            config.batch_queue_name = val;
        }
        if let Some(val) = lookup("BATCH_WORKERS") {
            config.batch_workers = parse_env_value(&val, "BATCH_WORKERS")?;
        }
        if let Some(val) = lookup("BATCH_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BATCH_TASK_TIMEOUT_SECS")?;
            config.batch_task_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("BATCH_MAX_RETRY") {
            config.batch_max_retry = parse_env_value(&val, "BATCH_MAX_RETRY")?;
        }

        config.generation_api_base = lookup("GENERATION_API_BASE");
        config.generation_api_key = lookup("GENERATION_API_KEY");
        config.platform_api_base = lookup("PLATFORM_API_BASE");
        config.platform_api_key = lookup("PLATFORM_API_KEY");
        if let Some(val) = lookup("PLATFORMS") {
            config.platforms = parse_platforms(&val)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }
        if self.batch_queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "batch_queue_name cannot be empty".to_string(),
            ));
        }
        if self.batch_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_workers must be greater than 0".to_string(),
            ));
        }
        if self.batch_task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "batch_task_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_job_timeout(self.job_timeout)
            .with_retry_backoff(self.retry_backoff)
            .with_max_concurrent_jobs(self.max_concurrent_jobs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_max_retry(self.batch_max_retry)
            .with_task_timeout(self.batch_task_timeout)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.batch_workers)
    }

    /// Platforms to register against the platform gateway.
    pub fn enabled_platforms(&self) -> Vec<Platform> {
        if self.platforms.is_empty() {
            Platform::ALL.to_vec()
        } else {
            self.platforms.clone()
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_batch_workers(mut self, workers: usize) -> Self {
        self.batch_workers = workers;
        self
    }

    pub fn with_batch_max_retry(mut self, max_retry: u32) -> Self {
        self.batch_max_retry = max_retry;
        self
    }

    pub fn with_generation_api(mut self, base: impl Into<String>, key: Option<String>) -> Self {
        self.generation_api_base = Some(base.into());
        self.generation_api_key = key;
        self
    }

    pub fn with_platform_api(mut self, base: impl Into<String>, key: Option<String>) -> Self {
        self.platform_api_base = Some(base.into());
        self.platform_api_key = key;
        self
    }

    pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
        self.platforms = platforms;
        self
    }
}

fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_platforms(value: &str) -> Result<Vec<Platform>, ConfigError> {
    let mut platforms = Vec::new();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let platform = Platform::from_str(name).map_err(|e| ConfigError::InvalidValue {
            key: "PLATFORMS".to_string(),
            message: e,
        })?;
        if !platforms.contains(&platform) {
            platforms.push(platform);
        }
    }
    Ok(platforms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert!(config.database_url.is_none());
        assert_eq!(config.batch_workers, 4);
        assert_eq!(config.batch_max_retry, 3);
        assert_eq!(config.batch_task_timeout, Duration::from_secs(1800));
        assert!(config.validate().is_ok());
        assert_eq!(config.enabled_platforms().len(), Platform::ALL.len());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://cache:6379"),
            ("DATABASE_URL", "postgres://db/reelcast"),
            ("SCHEDULER_POLL_INTERVAL_MS", "250"),
            ("SCHEDULER_MAX_CONCURRENT_JOBS", "3"),
            ("BATCH_WORKERS", "8"),
            ("BATCH_MAX_RETRY", "5"),
            ("PLATFORM_API_BASE", "http://gateway"),
            ("PLATFORMS", "youtube, X ,tiktok,youtube"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.database_url.as_deref(), Some("postgres://db/reelcast"));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.scheduler_config().max_concurrent_jobs, 3);
        assert_eq!(config.worker_pool_config().num_workers, 8);
        assert_eq!(config.orchestrator_config().max_retry, 5);
        assert_eq!(
            config.enabled_platforms(),
            vec![Platform::Youtube, Platform::Twitter, Platform::Tiktok]
        );
    }

    #[test]
    fn test_blank_database_url_is_ignored() {
        let config = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "  ")])).unwrap();
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_invalid_values() {
        let err = AppConfig::from_lookup(lookup(&[("BATCH_WORKERS", "many")])).unwrap_err();
        assert!(err.to_string().contains("BATCH_WORKERS"));

        let err = AppConfig::from_lookup(lookup(&[("PLATFORMS", "youtube,myspace")])).unwrap_err();
        assert!(err.to_string().contains("PLATFORMS"));

        let err = AppConfig::from_lookup(lookup(&[("BATCH_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_builder_and_validation() {
        let config = AppConfig::new()
            .with_redis_url("redis://other")
            .with_max_concurrent_jobs(0);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_concurrent_jobs"));

        let config = AppConfig::new().with_key_prefix("");
        assert!(config.validate().is_err());
    }
}
