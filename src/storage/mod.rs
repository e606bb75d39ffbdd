//! Job store abstraction.
//!
//! The engine reads and writes jobs, schedules, execution logs and
//! dead-letter records exclusively through the [`JobStore`] trait. Lifecycle
//! changes go through [`JobStore::transition`], a conditional update that
//! fails when the stored job no longer permits the transition, so concurrent
//! triggers can race for the same job and exactly one wins.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::job::{Job, JobStatus, JobType};
use crate::core::log::ExecutionLog;
use crate::core::schedule::JobSchedule;
use crate::core::state::{Transition, TransitionError};
use crate::core::types::JobId;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The record changed between read and conditional write.
    #[error("concurrent modification: {0}")]
    Conflict(String),

    /// The requested transition is not legal for the stored job.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether a conditional update lost to the job's current state.
    ///
    /// Callers racing for a job treat this as "someone else got there first".
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_) | StorageError::Transition(_))
    }
}

/// Record of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub job_id: JobId,
    pub job_name: String,
    pub reason: String,
    pub final_retry_count: u32,
    pub max_retries: u32,
    pub payload: Option<String>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Predicate over stored jobs.
///
/// Unset fields match everything. `scheduled_before` is inclusive, every
/// other time bound is exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub job_types: Vec<JobType>,
    pub created_by: Option<String>,
    pub exhausted: Option<bool>,
    pub scheduled_before: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub completed_before: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    /// A filter matching every job.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_types.push(job_type);
        self
    }

    pub fn with_created_by(mut self, owner: impl Into<String>) -> Self {
        self.created_by = Some(owner.into());
        self
    }

    pub fn with_exhausted(mut self, exhausted: bool) -> Self {
        self.exhausted = Some(exhausted);
        self
    }

    pub fn scheduled_before(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_before = Some(at);
        self
    }

    pub fn started_before(mut self, at: DateTime<Utc>) -> Self {
        self.started_before = Some(at);
        self
    }

    pub fn completed_before(mut self, at: DateTime<Utc>) -> Self {
        self.completed_before = Some(at);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    /// Restrict to jobs created in `[from, to)`.
    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_after = Some(from);
        self.created_before = Some(to);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate the filter against a job. The limit is not considered.
    pub fn matches(&self, job: &Job) -> bool {
        fn before(value: Option<DateTime<Utc>>, bound: Option<DateTime<Utc>>) -> bool {
            match bound {
                Some(bound) => value.is_some_and(|v| v < bound),
                None => true,
            }
        }

        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.job_types.is_empty() || self.job_types.contains(&job.job_type))
            && self
                .created_by
                .as_ref()
                .is_none_or(|owner| job.created_by.as_ref() == Some(owner))
            && self.exhausted.is_none_or(|e| job.exhausted == e)
            && self
                .scheduled_before
                .is_none_or(|bound| job.scheduled_at.is_some_and(|at| at <= bound))
            && before(job.started_at, self.started_before)
            && before(job.completed_at, self.completed_before)
            && before(Some(job.updated_at), self.updated_before)
            && before(Some(job.created_at), self.created_before)
            && self.created_after.is_none_or(|bound| job.created_at >= bound)
    }
}

/// Sort jobs into dispatch order: priority descending, then due time
/// ascending (unscheduled last), then creation time.
pub fn sort_for_dispatch(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| match (a.scheduled_at, b.scheduled_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// Durable store for the job lifecycle.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Job operations

    /// Insert a new job.
    async fn create_job(&self, job: Job) -> Result<(), StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError>;

    /// List jobs matching `filter`, in dispatch order.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError>;

    /// Atomically apply `transition` to the stored job.
    ///
    /// Returns the updated job. Fails with [`StorageError::Transition`] when
    /// the stored state does not permit the transition and with
    /// [`StorageError::Conflict`] when a concurrent writer got there first.
    async fn transition(
        &self,
        id: &JobId,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Result<Job, StorageError>;

    /// Delete a job together with its schedule and logs.
    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError>;

    /// Count jobs per status.
    async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, StorageError>;

    /// Count jobs per type.
    async fn count_by_type(&self) -> Result<BTreeMap<JobType, u64>, StorageError>;

    // Schedule operations

    /// Insert the schedule of a job.
    async fn save_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError>;

    /// Get the schedule of a job, if it has one.
    async fn get_schedule(&self, job_id: &JobId) -> Result<Option<JobSchedule>, StorageError>;

    /// Replace an existing schedule.
    async fn update_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError>;

    /// Replace a schedule only while it is active and its stored
    /// `next_execution` still equals `expected_next`.
    ///
    /// Fails with [`StorageError::Conflict`] otherwise. The writer that
    /// advances a schedule past an occurrence owns that occurrence.
    async fn advance_schedule(
        &self,
        schedule: JobSchedule,
        expected_next: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    /// Active schedules whose next execution is at or before `now`,
    /// earliest first.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<JobSchedule>, StorageError>;

    // Execution log operations

    /// Append an execution log entry.
    async fn append_log(&self, log: ExecutionLog) -> Result<(), StorageError>;

    /// List a job's log entries in insertion order.
    async fn list_logs(&self, job_id: &JobId) -> Result<Vec<ExecutionLog>, StorageError>;

    // Dead-letter operations

    /// Persist a dead-letter record.
    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<(), StorageError>;

    /// List dead-letter records, oldest first.
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, StorageError>;

    /// Dead-letter records of one job, oldest first.
    async fn dead_letters_for(&self, job_id: &JobId) -> Result<Vec<DeadLetterRecord>, StorageError>;
}
