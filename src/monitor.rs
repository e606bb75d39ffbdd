//! Stuck job detection.
//!
//! A job that stays Running past the stuck timeout is assumed lost (its
//! worker died or hung). The monitor force-fails it, which bypasses retry
//! evaluation, and raises an alert.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::core::job::{Job, JobStatus};
use crate::core::log::ExecutionLog;
use crate::core::state::Transition;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::storage::{JobFilter, JobStore, StorageError};

/// Default time a job may stay Running.
pub const DEFAULT_STUCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Error message recorded on jobs failed by the periodic monitor.
pub const STUCK_TIMEOUT_MESSAGE: &str = "Job failed due to stuck timeout";

/// Finds and force-fails Running jobs older than a timeout.
pub struct StuckJobMonitor {
    store: Arc<dyn JobStore>,
    notifier: Arc<Notifier>,
    timeout: Duration,
    message: String,
}

impl StuckJobMonitor {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            notifier,
            timeout: DEFAULT_STUCK_TIMEOUT,
            message: STUCK_TIMEOUT_MESSAGE.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Error message written to force-failed jobs.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Running jobs whose `started_at` precedes `now - timeout`.
    pub async fn find_stuck_at(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        let cutoff = now - to_chrono(self.timeout);
        self.store
            .list_jobs(
                &JobFilter::new()
                    .with_status(JobStatus::Running)
                    .started_before(cutoff),
            )
            .await
    }

    /// Force-fail every stuck job as of `now` and return the jobs failed.
    ///
    /// A job that finishes between the query and the update is left alone.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        let stuck = self.find_stuck_at(now).await?;
        if stuck.is_empty() {
            tracing::debug!("no stuck jobs found");
            return Ok(Vec::new());
        }

        let mut failed = Vec::with_capacity(stuck.len());
        for job in stuck {
            let transition = Transition::ForceFail {
                error: self.message.clone(),
            };
            let job = match self.store.transition(&job.id, &transition, now).await {
                Ok(job) => job,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(job_id = %job.id, reason = %e, "stuck job finished before it was failed");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to force-fail stuck job");
                    continue;
                }
            };

            let running_for = job
                .started_at
                .map(|started| (now - started).num_seconds())
                .unwrap_or_default();
            let details = format!("running for {}s, timeout {}s", running_for, self.timeout.as_secs());

            let log = ExecutionLog::error(job.id, self.message.clone())
                .with_details(details.clone())
                .at(now);
            if let Err(e) = self.store.append_log(log).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to append execution log");
            }

            tracing::error!(
                job_id = %job.id,
                job_name = %job.name,
                running_for_secs = running_for,
                "stuck job force-failed"
            );
            self.notifier
                .send(Notification::new(NotificationKind::StuckJob, job.clone()).with_details(details))
                .await;
            failed.push(job);
        }

        tracing::warn!(count = failed.len(), "stuck job sweep failed jobs");
        Ok(failed)
    }

    pub async fn sweep(&self) -> Result<Vec<Job>, StorageError> {
        self.sweep_at(Utc::now()).await
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}
