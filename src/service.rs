//! Job creation and lookup.
//!
//! [`JobService`] is the write path for new work: it validates a job, pins
//! its type to the kind of schedule requested, and persists the job together
//! with that schedule.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::core::job::{Job, JobType};
use crate::core::log::ExecutionLog;
use crate::core::schedule::{DEFAULT_TIMEZONE, JobSchedule, ScheduleError};
use crate::core::state::Transition;
use crate::core::types::JobId;
use crate::storage::{JobFilter, JobStore, StorageError};

/// Errors raised by [`JobService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Creates, cancels and inspects jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Persist a job that runs once at `at`.
    pub async fn create_one_time(&self, job: Job, at: DateTime<Utc>) -> Result<Job, ServiceError> {
        self.create_at(job, JobType::OneTime, at).await
    }

    /// Persist a batch job. Batch jobs are dispatched by the one-time trigger.
    pub async fn create_batch(&self, job: Job, at: DateTime<Utc>) -> Result<Job, ServiceError> {
        self.create_at(job, JobType::Batch, at).await
    }

    /// Persist a job that fires on every occurrence of `expression`.
    ///
    /// The expression may be a 5 or 6-field cron line, an `@hourly`-style
    /// shortcut or an `@every <duration>` interval. `timezone` defaults to
    /// UTC.
    pub async fn create_recurring(
        &self,
        mut job: Job,
        expression: &str,
        timezone: Option<&str>,
    ) -> Result<Job, ServiceError> {
        validate(&job)?;
        let now = Utc::now();
        let schedule = JobSchedule::recurring(
            job.id,
            expression,
            timezone.unwrap_or(DEFAULT_TIMEZONE),
            now,
        )?;

        job.job_type = JobType::Recurring;
        job.scheduled_at = schedule.next_execution;
        self.store.create_job(job.clone()).await?;
        self.store.save_schedule(schedule.clone()).await?;

        tracing::info!(
            job_id = %job.id,
            job_name = %job.name,
            expression = %expression,
            next_execution = ?schedule.next_execution,
            "recurring job created"
        );
        Ok(job)
    }

    async fn create_at(
        &self,
        mut job: Job,
        job_type: JobType,
        at: DateTime<Utc>,
    ) -> Result<Job, ServiceError> {
        validate(&job)?;
        job.job_type = job_type;
        job.scheduled_at = Some(at);

        self.store.create_job(job.clone()).await?;
        self.store.save_schedule(JobSchedule::one_time(job.id, at)).await?;

        tracing::info!(
            job_id = %job.id,
            job_name = %job.name,
            job_type = %job_type,
            scheduled_at = %at,
            "job created"
        );
        Ok(job)
    }

    /// Cancel a Scheduled or Retrying job and stop its schedule.
    ///
    /// A Running job is not interrupted; cancelling it is rejected.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, ServiceError> {
        let now = Utc::now();
        let job = self.store.transition(id, &Transition::Cancel, now).await?;

        if let Some(mut schedule) = self.store.get_schedule(id).await? {
            if schedule.is_active {
                schedule.deactivate(now);
                self.store.update_schedule(schedule).await?;
            }
        }

        let log = ExecutionLog::info(job.id, "Job cancelled").at(now);
        if let Err(e) = self.store.append_log(log).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to append execution log");
        }
        tracing::info!(job_id = %job.id, "job cancelled");
        Ok(job)
    }

    pub async fn get(&self, id: &JobId) -> Result<Job, ServiceError> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, ServiceError> {
        Ok(self.store.list_jobs(filter).await?)
    }

    /// Execution history of a job, oldest first.
    pub async fn logs(&self, id: &JobId) -> Result<Vec<ExecutionLog>, ServiceError> {
        // Surface NotFound for unknown jobs rather than an empty history.
        self.store.get_job(id).await?;
        Ok(self.store.list_logs(id).await?)
    }
}

fn validate(job: &Job) -> Result<(), ServiceError> {
    if job.name.trim().is_empty() {
        return Err(ServiceError::InvalidJob("name must not be empty".into()));
    }
    if job.status != crate::core::job::JobStatus::Scheduled {
        return Err(ServiceError::InvalidJob(format!(
            "new jobs must be scheduled, got {}",
            job.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobStatus;
    use crate::core::schedule::ScheduleType;
    use crate::storage::InMemoryJobStore;
    use chrono::Duration;

    fn service() -> (JobService, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        (JobService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_create_one_time_saves_job_and_schedule() {
        let (service, store) = service();
        let at = Utc::now() + Duration::minutes(5);

        let job = service
            .create_one_time(Job::new("report", JobType::Recurring), at)
            .await
            .unwrap();

        assert_eq!(job.job_type, JobType::OneTime);
        assert_eq!(store.get_job(&job.id).await.unwrap().scheduled_at, Some(at));
        let schedule = store.get_schedule(&job.id).await.unwrap().unwrap();
        assert_eq!(schedule.schedule_type, ScheduleType::OneTime);
        assert_eq!(schedule.next_execution, Some(at));
        assert!(schedule.is_active);
    }

    #[tokio::test]
    async fn test_create_recurring_computes_next_execution() {
        let (service, store) = service();
        let before = Utc::now();

        let job = service
            .create_recurring(Job::new("hourly", JobType::OneTime), "@hourly", None)
            .await
            .unwrap();

        assert_eq!(job.job_type, JobType::Recurring);
        let schedule = store.get_schedule(&job.id).await.unwrap().unwrap();
        assert_eq!(schedule.schedule_type, ScheduleType::Cron);
        assert_eq!(schedule.timezone, "UTC");
        assert!(schedule.next_execution.unwrap() > before);
        assert_eq!(job.scheduled_at, schedule.next_execution);
    }

    #[tokio::test]
    async fn test_invalid_expression_creates_nothing() {
        let (service, store) = service();

        let result = service
            .create_recurring(Job::new("bad", JobType::Recurring), "not a cron", None)
            .await;

        assert!(matches!(result, Err(ServiceError::Schedule(_))));
        assert!(store.list_jobs(&JobFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interval_beyond_date_range_creates_nothing() {
        let (service, store) = service();

        let result = service
            .create_recurring(Job::new("far", JobType::Recurring), "@every 99999999d", None)
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::Schedule(ScheduleError::NoMoreOccurrences))
        ));
        assert!(store.list_jobs(&JobFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let (service, _store) = service();
        let result = service
            .create_one_time(Job::new("  ", JobType::OneTime), Utc::now())
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidJob(_))));
    }

    #[tokio::test]
    async fn test_cancel_deactivates_schedule() {
        let (service, store) = service();
        let job = service
            .create_one_time(Job::new("report", JobType::OneTime), Utc::now())
            .await
            .unwrap();

        let cancelled = service.cancel(&job.id).await.unwrap();

        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(!store.get_schedule(&job.id).await.unwrap().unwrap().is_active);
        let logs = service.logs(&job.id).await.unwrap();
        assert_eq!(logs.last().unwrap().message, "Job cancelled");
    }

    #[tokio::test]
    async fn test_cancel_running_job_is_conflict() {
        let (service, store) = service();
        let job = service
            .create_one_time(Job::new("report", JobType::OneTime), Utc::now())
            .await
            .unwrap();
        store
            .transition(&job.id, &Transition::Dispatch, Utc::now())
            .await
            .unwrap();

        let err = service.cancel(&job.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Storage(ref e) if e.is_conflict()));
        assert!(store.get_schedule(&job.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_logs_of_unknown_job() {
        let (service, _store) = service();
        assert!(matches!(
            service.logs(&JobId::new()).await,
            Err(ServiceError::Storage(StorageError::NotFound(_)))
        ));
    }
}
