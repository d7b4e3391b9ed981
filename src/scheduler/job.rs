//! Job definitions for the scheduler.
//!
//! This module defines the core types stored by the job store:
//!
//! - `Job`: a unit of deferred work addressed to a named handler
//! - `JobStatus`: lifecycle state of a job
//! - `RecurringRule` / `RecurringJob`: definitions that expand into jobs over time

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry budget for a job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Lifecycle state of a job.
///
/// `Delayed -> Active -> {Completed | Failed}`. A failed attempt with budget
/// left goes back to `Delayed` with a later run-at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the job will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work executed by the scheduler at or after `run_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// Name of the registered handler that executes this job.
    pub handler: String,
    /// Opaque handler input.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Requested delay relative to submission, used when `run_at` is absent.
    #[serde(default)]
    pub delay_secs: u64,
    /// When the job becomes due.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    /// Number of executions started so far.
    #[serde(default)]
    pub attempts: u32,
    /// Total executions allowed before the job is failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub status: JobStatus,
    /// Error from the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Occurrence of the recurring series this job was expanded from.
    /// Unlike `run_at` it survives retries.
    #[serde(default)]
    pub occurrence: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new delayed job for `handler` with default retry budget.
    pub fn new(handler: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            handler: handler.into(),
            payload,
            delay_secs: 0,
            run_at: None,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            status: JobStatus::Delayed,
            last_error: None,
            occurrence: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets a delay relative to the time the job is added.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay_secs = delay.as_secs();
        self
    }

    /// Pins the job to an absolute time.
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Tags the job with the recurring occurrence it stands for.
    pub fn with_occurrence(mut self, occurrence: DateTime<Utc>) -> Self {
        self.occurrence = Some(occurrence);
        self
    }

    /// Sets the retry budget. A budget of zero is treated as one attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Returns true if another attempt is allowed after the current one.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_retries
    }

    /// Returns the number of attempts left.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempts)
    }

    /// Deserializes the payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Unit of a recurring rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("unknown frequency '{}'", other)),
        }
    }
}

/// How often a recurring job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRule {
    pub frequency: Frequency,
    /// Number of frequency units between occurrences, at least 1.
    pub interval: u32,
}

impl RecurringRule {
    pub fn new(frequency: Frequency, interval: u32) -> Self {
        Self {
            frequency,
            interval: interval.max(1),
        }
    }

    pub fn daily() -> Self {
        Self::new(Frequency::Daily, 1)
    }

    pub fn weekly() -> Self {
        Self::new(Frequency::Weekly, 1)
    }

    pub fn monthly() -> Self {
        Self::new(Frequency::Monthly, 1)
    }

    /// Computes the occurrence following `last_run`.
    ///
    /// Monthly rules keep the day of month where possible and clamp to the
    /// last day otherwise (Jan 31 + 1 month = Feb 28/29). Returns `None` only
    /// when the result is out of the representable range.
    pub fn next_run(&self, last_run: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = self.interval.max(1);
        match self.frequency {
            Frequency::Daily => last_run.checked_add_signed(Duration::days(i64::from(interval))),
            Frequency::Weekly => {
                last_run.checked_add_signed(Duration::weeks(i64::from(interval)))
            }
            Frequency::Monthly => last_run.checked_add_months(Months::new(interval)),
        }
    }
}

/// A named recurring definition. The definition is the only durable state
/// of a recurring series; concrete jobs are created as occurrences come due.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurringJob {
    pub name: String,
    pub handler: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub rule: RecurringRule,
    pub last_run: DateTime<Utc>,
}

impl RecurringJob {
    pub fn new(
        name: impl Into<String>,
        handler: impl Into<String>,
        payload: serde_json::Value,
        rule: RecurringRule,
        last_run: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            payload,
            rule,
            last_run,
        }
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.rule.next_run(self.last_run)
    }

    /// Returns every occurrence that has come due by `now`, oldest first.
    pub fn due_occurrences(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut due = Vec::new();
        let mut cursor = self.last_run;
        while let Some(next) = self.rule.next_run(cursor) {
            if next > now {
                break;
            }
            due.push(next);
            cursor = next;
        }
        due
    }
}
