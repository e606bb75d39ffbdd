//! Scheduler type definitions.
//!
//! This module contains error types, state enums, settings and command types
//! for the scheduler.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::job::{Job, JobStatus};
use crate::core::retry::BackoffPolicy;
use crate::core::schedule::ScheduleError;
use crate::core::types::JobId;
use crate::execution::{DEFAULT_JOB_WORKERS, DEFAULT_RETRY_WORKERS, ExecutionError, Outcome};
use crate::pipeline::PipelineError;
use crate::service::ServiceError;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The job's state does not allow the request.
    #[error("job {id} cannot be run while {status}")]
    NotRunnable { id: JobId, status: JobStatus },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Claim or submission error.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Schedule evaluation error.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Failure pipeline error.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Job service error.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

impl SchedulerError {
    /// Whether the error means another caller won a race for the job.
    pub fn is_conflict(&self) -> bool {
        match self {
            SchedulerError::Storage(e) => e.is_conflict(),
            SchedulerError::Execution(ExecutionError::Claim(e)) => e.is_conflict(),
            SchedulerError::Service(ServiceError::Storage(e)) => e.is_conflict(),
            _ => false,
        }
    }
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// The engine's periodic triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Dispatch due one-time and batch jobs.
    OneTime,
    /// Fire due recurring schedules.
    Recurring,
    /// Repair the failure pipeline.
    RetrySweep,
    /// Fail jobs running past the stuck timeout.
    StuckJobs,
}

impl Trigger {
    pub const ALL: [Trigger; 4] = [
        Trigger::OneTime,
        Trigger::Recurring,
        Trigger::RetrySweep,
        Trigger::StuckJobs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Trigger::OneTime => "one-time-scheduler",
            Trigger::Recurring => "recurring-scheduler",
            Trigger::RetrySweep => "retry-sweep",
            Trigger::StuckJobs => "stuck-job-monitor",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine timing and capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub one_time_interval: Duration,
    pub recurring_interval: Duration,
    pub retry_sweep_interval: Duration,
    pub stuck_check_interval: Duration,
    pub stuck_timeout: Duration,
    pub job_workers: usize,
    pub retry_workers: usize,
    pub backoff: BackoffPolicy,
    /// Graceful shutdown timeout for in-flight executions.
    pub shutdown_timeout: Duration,
}

impl SchedulerSettings {
    /// Settings for tests: triggers effectively never fire on their own and
    /// retries back off in milliseconds.
    pub fn for_tests() -> Self {
        let idle = Duration::from_secs(3600);
        Self {
            one_time_interval: idle,
            recurring_interval: idle,
            retry_sweep_interval: idle,
            stuck_check_interval: idle,
            backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
            shutdown_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Timer period of a trigger.
    pub fn interval(&self, trigger: Trigger) -> Duration {
        match trigger {
            Trigger::OneTime => self.one_time_interval,
            Trigger::Recurring => self.recurring_interval,
            Trigger::RetrySweep => self.retry_sweep_interval,
            Trigger::StuckJobs => self.stuck_check_interval,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            one_time_interval: Duration::from_secs(30),
            recurring_interval: Duration::from_secs(60),
            retry_sweep_interval: Duration::from_secs(300),
            stuck_check_interval: Duration::from_secs(3600),
            stuck_timeout: Duration::from_secs(30 * 60),
            job_workers: DEFAULT_JOB_WORKERS,
            retry_workers: DEFAULT_RETRY_WORKERS,
            backoff: BackoffPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Fire a trigger immediately.
    Tick {
        trigger: Trigger,
        response: oneshot::Sender<Result<usize, SchedulerError>>,
    },
    /// Run a job now and report its outcome.
    RunNow {
        job_id: JobId,
        response: oneshot::Sender<Result<Outcome, SchedulerError>>,
    },
    /// Cancel a job.
    Cancel {
        job_id: JobId,
        response: oneshot::Sender<Result<Job, SchedulerError>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
