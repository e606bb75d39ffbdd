//! Job state machine.
//!
//! Every mutation of a job's lifecycle goes through [`Job::apply`], which
//! validates the [`Transition`] against the current state and leaves the job
//! untouched when the transition is illegal. Stores use the same check to
//! implement their conditional updates.
//!
//! ```text
//! Scheduled --Dispatch--> Running --Complete--> Completed
//!     |                      |  \--Fail / ForceFail--> Failed --BeginRetry--> Retrying
//!     |                      |                                                   |
//!     +--Cancel--> Cancelled <---------------------Cancel------------------------+
//!                            Running <--Redispatch-------------------------------+
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::job::{Job, JobStatus, JobType};

/// A requested lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Claim a scheduled job for execution.
    Dispatch,
    /// Claim a retrying job once its backoff delay has elapsed.
    Redispatch,
    /// Record a successful execution.
    Complete,
    /// Record a failed execution.
    Fail { error: String },
    /// Consume one retry. Legal only while the stored retry count still equals
    /// `expected_retry_count`, which makes duplicate retry events harmless.
    BeginRetry { expected_retry_count: u32 },
    /// Operator cancellation.
    Cancel,
    /// Fail a running job without retry evaluation (stuck timeout).
    ForceFail { error: String },
    /// Flag a failed job as no longer retry-eligible.
    MarkExhausted,
    /// Put a finished recurring job back into Scheduled for its next occurrence.
    Rearm { next_run: DateTime<Utc> },
}

impl Transition {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Dispatch => "dispatch",
            Transition::Redispatch => "redispatch",
            Transition::Complete => "complete",
            Transition::Fail { .. } => "fail",
            Transition::BeginRetry { .. } => "begin_retry",
            Transition::Cancel => "cancel",
            Transition::ForceFail { .. } => "force_fail",
            Transition::MarkExhausted => "mark_exhausted",
            Transition::Rearm { .. } => "rearm",
        }
    }
}

/// Reasons a transition is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The transition is not defined for the job's current state.
    #[error("cannot {transition} a job in state {from}")]
    Illegal {
        from: JobStatus,
        transition: &'static str,
    },

    /// The retry budget is used up.
    #[error("retry budget exhausted ({count}/{max})")]
    RetriesExhausted { count: u32, max: u32 },

    /// The job was already retried for this failure.
    #[error("stale retry: expected retry count {expected}, found {actual}")]
    StaleRetryCount { expected: u32, actual: u32 },

    /// Only recurring jobs can be re-armed.
    #[error("job type {0} cannot be re-armed")]
    NotRecurring(JobType),
}

impl Job {
    /// Check whether `transition` is legal for the job in its current state.
    pub fn check(&self, transition: &Transition) -> Result<(), TransitionError> {
        let illegal = || TransitionError::Illegal {
            from: self.status,
            transition: transition.name(),
        };

        match (transition, self.status) {
            (Transition::Dispatch, JobStatus::Scheduled) => Ok(()),
            (Transition::Redispatch, JobStatus::Retrying) => Ok(()),
            (Transition::Complete, JobStatus::Running) => Ok(()),
            (Transition::Fail { .. }, JobStatus::Running) => Ok(()),
            (Transition::ForceFail { .. }, JobStatus::Running) => Ok(()),
            (
                Transition::BeginRetry {
                    expected_retry_count,
                },
                JobStatus::Failed,
            ) => {
                if self.exhausted {
                    return Err(illegal());
                }
                if self.current_retry_count != *expected_retry_count {
                    return Err(TransitionError::StaleRetryCount {
                        expected: *expected_retry_count,
                        actual: self.current_retry_count,
                    });
                }
                if self.current_retry_count >= self.max_retries {
                    return Err(TransitionError::RetriesExhausted {
                        count: self.current_retry_count,
                        max: self.max_retries,
                    });
                }
                Ok(())
            }
            (Transition::Cancel, JobStatus::Scheduled | JobStatus::Retrying) => Ok(()),
            (Transition::MarkExhausted, JobStatus::Failed) => Ok(()),
            (Transition::Rearm { .. }, status) => {
                if self.job_type != JobType::Recurring {
                    return Err(TransitionError::NotRecurring(self.job_type));
                }
                match status {
                    JobStatus::Completed => Ok(()),
                    JobStatus::Failed if self.exhausted => Ok(()),
                    _ => Err(illegal()),
                }
            }
            _ => Err(illegal()),
        }
    }

    /// Apply `transition` at time `at`.
    ///
    /// On error the job is left unchanged.
    pub fn apply(&mut self, transition: &Transition, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.check(transition)?;

        match transition {
            Transition::Dispatch | Transition::Redispatch => {
                self.status = JobStatus::Running;
                self.started_at = Some(at);
                self.completed_at = None;
            }
            Transition::Complete => {
                self.status = JobStatus::Completed;
                self.completed_at = Some(at);
                self.error_message = None;
            }
            Transition::Fail { error } => {
                self.status = JobStatus::Failed;
                self.completed_at = Some(at);
                self.error_message = Some(error.clone());
            }
            Transition::ForceFail { error } => {
                self.status = JobStatus::Failed;
                self.completed_at = Some(at);
                self.error_message = Some(error.clone());
                self.exhausted = true;
            }
            Transition::BeginRetry { .. } => {
                self.current_retry_count += 1;
                self.status = JobStatus::Retrying;
                self.completed_at = None;
            }
            Transition::Cancel => {
                self.status = JobStatus::Cancelled;
                self.completed_at = Some(at);
            }
            Transition::MarkExhausted => {
                self.exhausted = true;
            }
            Transition::Rearm { next_run } => {
                self.status = JobStatus::Scheduled;
                self.scheduled_at = Some(*next_run);
                self.current_retry_count = 0;
                self.exhausted = false;
                self.started_at = None;
                self.completed_at = None;
                self.error_message = None;
            }
        }

        self.updated_at = at;
        Ok(())
    }
}
