//! Job record and lifecycle enums.
//!
//! A [`Job`] is the durable unit of work tracked by the engine. It is created
//! in [`JobStatus::Scheduled`] and afterwards mutated only through
//! `Job::apply` with a [`Transition`](crate::core::state::Transition).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::types::JobId;

/// Default retry budget for new jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How a job is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Runs once at its scheduled time.
    OneTime,
    /// Runs on every occurrence of a cron or interval schedule.
    Recurring,
    /// Runs once, as part of a batch submission.
    Batch,
}

impl JobType {
    /// Every job type, in declaration order.
    pub const ALL: [JobType; 3] = [JobType::OneTime, JobType::Recurring, JobType::Batch];

    /// Stable textual form used in storage and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::OneTime => "one_time",
            JobType::Recurring => "recurring",
            JobType::Batch => "batch",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(JobType::OneTime),
            "recurring" => Ok(JobType::Recurring),
            "batch" => Ok(JobType::Batch),
            other => Err(format!("unknown job type: {}", other)),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a scheduler trigger.
    Scheduled,
    /// Claimed and executing (or waiting for a worker slot).
    Running,
    /// Finished successfully.
    Completed,
    /// Execution failed. Terminal unless the retry pipeline picks it up.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
    /// Waiting for its backoff delay before re-dispatch.
    Retrying,
}

impl JobStatus {
    /// Every status, in declaration order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Retrying,
    ];

    /// Stable textual form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }

    /// Completed, Failed and Cancelled are terminal from the scheduler's view.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "retrying" => Ok(JobStatus::Retrying),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Human-readable job name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// How the job is triggered.
    pub job_type: JobType,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Opaque payload handed to the job runner.
    pub payload: Option<String>,
    /// Higher values are dispatched first.
    pub priority: i32,
    /// Retry budget.
    pub max_retries: u32,
    /// Retries consumed so far. Never exceeds `max_retries`.
    pub current_retry_count: u32,
    /// Set once the job has been dead-lettered or force-failed; such a
    /// failed job is never retried.
    pub exhausted: bool,
    /// Owner of the job.
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the job becomes due.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the current or last execution was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job last entered a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason of the last failed execution.
    pub error_message: Option<String>,
}

impl Job {
    /// Create a new job in the Scheduled state.
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            description: None,
            job_type,
            status: JobStatus::Scheduled,
            payload: None,
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            current_retry_count: 0,
            exhausted: false,
            created_by: None,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the owner.
    pub fn with_created_by(mut self, owner: impl Into<String>) -> Self {
        self.created_by = Some(owner.into());
        self
    }

    /// Set the due time.
    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Whether the retry pipeline may still retry this job.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed
            && !self.exhausted
            && self.current_retry_count < self.max_retries
    }

    /// Whether the job is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Scheduled && self.scheduled_at.is_some_and(|at| at <= now)
    }
}
