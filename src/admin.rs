//! Operator queries and maintenance.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::job::{Job, JobStatus, JobType};
use crate::monitor::StuckJobMonitor;
use crate::notify::Notifier;
use crate::storage::{JobFilter, JobStore, StorageError};

/// Error message recorded on jobs reset by an operator.
pub const RESET_TIMEOUT_MESSAGE: &str = "Job was reset due to timeout";

/// Aggregate view of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatistics {
    pub total: u64,
    pub by_status: BTreeMap<JobStatus, u64>,
    pub by_type: BTreeMap<JobType, u64>,
    /// Running jobs past the stuck timeout.
    pub stuck: u64,
    pub dead_letters: u64,
    pub generated_at: DateTime<Utc>,
}

/// Administrative operations over a job store.
pub struct Admin {
    store: Arc<dyn JobStore>,
    notifier: Arc<Notifier>,
    stuck_timeout: Duration,
}

impl Admin {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            notifier,
            stuck_timeout: crate::monitor::DEFAULT_STUCK_TIMEOUT,
        }
    }

    /// Timeout used by [`Admin::statistics`] to count stuck jobs.
    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    fn monitor(&self, timeout: Duration) -> StuckJobMonitor {
        StuckJobMonitor::new(Arc::clone(&self.store), Arc::clone(&self.notifier))
            .with_timeout(timeout)
            .with_message(RESET_TIMEOUT_MESSAGE)
    }

    pub async fn stuck_jobs(&self, timeout: Duration) -> Result<Vec<Job>, StorageError> {
        self.stuck_jobs_at(timeout, Utc::now()).await
    }

    pub async fn stuck_jobs_at(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StorageError> {
        self.monitor(timeout).find_stuck_at(now).await
    }

    /// Force-fail Running jobs older than `timeout`. Returns the reset jobs.
    pub async fn reset_stuck_jobs(&self, timeout: Duration) -> Result<Vec<Job>, StorageError> {
        self.reset_stuck_jobs_at(timeout, Utc::now()).await
    }

    pub async fn reset_stuck_jobs_at(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StorageError> {
        let reset = self.monitor(timeout).sweep_at(now).await?;
        tracing::info!(count = reset.len(), "reset stuck jobs");
        Ok(reset)
    }

    /// Finished jobs whose `completed_at` is more than `days` days old.
    ///
    /// Recurring jobs with an active schedule are still live and never
    /// eligible.
    pub async fn jobs_for_cleanup(&self, days: u32) -> Result<Vec<Job>, StorageError> {
        self.jobs_for_cleanup_at(days, Utc::now()).await
    }

    pub async fn jobs_for_cleanup_at(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StorageError> {
        let cutoff = now - chrono::Duration::days(i64::from(days));
        let finished = self
            .store
            .list_jobs(
                &JobFilter::new()
                    .with_statuses([JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled])
                    .completed_before(cutoff),
            )
            .await?;

        let mut eligible = Vec::with_capacity(finished.len());
        for job in finished {
            if job.job_type == JobType::Recurring
                && let Some(schedule) = self.store.get_schedule(&job.id).await?
                && schedule.is_active
            {
                continue;
            }
            eligible.push(job);
        }
        Ok(eligible)
    }

    /// Delete finished jobs older than `days` days along with their schedules
    /// and logs. Returns the number of jobs deleted.
    pub async fn cleanup(&self, days: u32) -> Result<usize, StorageError> {
        self.cleanup_at(days, Utc::now()).await
    }

    pub async fn cleanup_at(&self, days: u32, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for job in self.jobs_for_cleanup_at(days, now).await? {
            match self.store.delete_job(&job.id).await {
                Ok(()) => deleted += 1,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(deleted, days, "cleaned up old jobs");
        Ok(deleted)
    }

    pub async fn statistics(&self) -> Result<JobStatistics, StorageError> {
        let now = Utc::now();
        let by_status = self.store.count_by_status().await?;
        let by_type = self.store.count_by_type().await?;
        let stuck = self.stuck_jobs_at(self.stuck_timeout, now).await?.len() as u64;
        let dead_letters = self.store.list_dead_letters().await?.len() as u64;

        Ok(JobStatistics {
            total: by_status.values().sum(),
            by_status,
            by_type,
            stuck,
            dead_letters,
            generated_at: now,
        })
    }
}
