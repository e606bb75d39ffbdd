//! Job execution.
//!
//! This module provides the executor pool that runs claimed jobs, the
//! [`JobRunner`] abstraction for job bodies, and a subprocess runner.

mod command;
mod executor;
mod runner;

pub use command::{CommandRunner, CommandSpec};
pub use executor::{
    DEFAULT_JOB_WORKERS, DEFAULT_RETRY_WORKERS, ExecutionError, ExecutionHandle, ExecutorPool,
    Lane, Outcome,
};
pub use runner::{JobError, JobRunner};
