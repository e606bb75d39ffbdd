//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of a running scheduler: manual ticks, run-now, cancel, pause, resume and
//! shutdown.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::job::Job;
use crate::core::types::JobId;
use crate::execution::Outcome;

use super::types::{SchedulerCommand, SchedulerError, SchedulerState, Trigger};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    /// Fire a trigger now, regardless of its timer and of pause.
    ///
    /// Returns the number of jobs the trigger acted on.
    pub async fn tick(&self, trigger: Trigger) -> Result<usize, SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::Tick { trigger, response },
            "tick",
        )
        .await
    }

    /// Claim a job and run it on the job lane, waiting for the outcome.
    pub async fn run_now(&self, job_id: JobId) -> Result<Outcome, SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::RunNow { job_id, response },
            "run_now",
        )
        .await
    }

    /// Cancel a Scheduled or Retrying job.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job, SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::Cancel { job_id, response },
            "cancel",
        )
        .await
    }

    /// Pause the scheduler.
    ///
    /// While paused, periodic triggers do nothing, but manual ticks and
    /// run-now still work. In-flight executions and retry timers continue.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shutdown the scheduler.
    ///
    /// Stops the triggers and consumers, drops armed retry timers, and waits
    /// for in-flight executions up to the shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }
}
