//! Job record, priority bands and the status state machine.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::retry::{self, FailOutcome};

/// Hard execution ceiling applied when the producer does not pick one.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

/// Retry ceiling applied when the producer does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound for `timeout_seconds` (30 days).
pub const MAX_TIMEOUT_SECONDS: u64 = 30 * 24 * 3600;

/// Dispatch priority band.
///
/// Serialized as its integer value (1..=4). Higher bands are always drained
/// before lower ones.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// All bands, lowest first.
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Bands a dispatcher scans, highest first, stopping at `min`.
    pub fn dispatch_order(min: Priority) -> impl Iterator<Item = Priority> {
        Self::ALL.into_iter().rev().filter(move |p| *p >= min)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(DomainError::validation(format!(
                "priority must be 1..=4, got {other}"
            ))),
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.as_u8()
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    /// Accepts either the band number (`"3"`) or its name (`"high"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Priority::try_from(n);
        }
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown priority: {s}")))
    }
}

/// Job execution status.
///
/// ```text
/// queued -> running -> completed
///                   -> failed      (retries exhausted)
///                   -> queued      (retry)
/// queued -> cancelled
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in its priority band
    Queued,
    /// Handed to a worker
    Running,
    /// Handler returned a value
    Completed,
    /// Failed with no retries left
    Failed,
    /// Cancelled before dispatch
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer request to enqueue a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: Priority,
    pub owner: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: Priority::default(),
            owner: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if self.timeout_seconds == 0 {
            return Err(DomainError::validation("timeout_seconds must be positive"));
        }
        if self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(DomainError::validation(format!(
                "timeout_seconds must be at most {MAX_TIMEOUT_SECONDS}"
            )));
        }
        if !self.payload.is_object() {
            return Err(DomainError::validation("payload must be a JSON object"));
        }
        Ok(())
    }

    /// Validate and materialize a fresh `queued` record with a new id.
    pub fn into_record(self, now: DateTime<Utc>) -> DomainResult<JobRecord> {
        self.validate()?;
        Ok(JobRecord {
            job_id: JobId::new(),
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: self.max_retries,
            owner: self.owner,
            timeout_seconds: self.timeout_seconds,
        })
    }
}

/// The persisted unit of work.
///
/// Fields added after schema version 1 must carry a serde default so older
/// records keep decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: Priority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Present only on `completed`. A handler may legitimately return `null`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(Some)
}

impl JobRecord {
    fn transition(&self, to: JobStatus) -> DomainResult<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    /// Hard execution ceiling as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Mark the job as handed to a worker.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    /// Record a successful handler result.
    pub fn mark_completed(&mut self, result: JsonValue, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// Record a failed attempt and apply the retry rule.
    ///
    /// Either returns the record to `queued` with a bumped `retry_count` and
    /// cleared attempt fields, or finalizes it as `failed`.
    pub fn apply_failure(&mut self, error: &str, now: DateTime<Utc>) -> DomainResult<FailOutcome> {
        self.transition(JobStatus::Failed)?;

        let outcome = retry::decide(self.retry_count, self.max_retries);
        match outcome {
            FailOutcome::Requeued { retry_count } => {
                self.retry_count = retry_count;
                self.status = JobStatus::Queued;
                self.started_at = None;
                self.completed_at = None;
                self.error = None;
                self.result = None;
            }
            FailOutcome::Failed => {
                self.status = JobStatus::Failed;
                self.error = Some(retry::exhausted_message(self.retry_count + 1, error));
                self.completed_at = Some(now);
                self.result = None;
            }
        }
        Ok(outcome)
    }

    /// Cancel a job that has not been dispatched yet.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }

    /// A running job whose timeout plus `grace` has elapsed.
    ///
    /// No live worker can still own it: the pool would already have timed it out.
    pub fn is_orphaned(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let Some(started_at) = self.started_at else {
            return true;
        };
        let ceiling = chrono::Duration::from_std(self.timeout().saturating_add(grace))
            .unwrap_or(chrono::Duration::MAX);
        started_at
            .checked_add_signed(ceiling)
            .is_some_and(|deadline| deadline < now)
    }
}
