//! The job body abstraction.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::core::job::Job;

/// Errors reported by a job body.
#[derive(Debug, Error)]
pub enum JobError {
    /// The body failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The body ran past its timeout.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// External command exited unsuccessfully.
    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    /// The payload could not be interpreted.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Runs the body of a job.
///
/// Implementations only perform the work; the executor pool owns every
/// state transition around the call.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job) -> Result<(), JobError>;
}
