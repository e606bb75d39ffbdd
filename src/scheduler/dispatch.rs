//! Discovery and dispatch of due work.
//!
//! Each tick queries the store, orders the candidates, and claims them one
//! at a time. Claims are conditional updates, so overlapping ticks (or
//! several engine instances sharing a store) dispatch a job at most once.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::types::SchedulerError;
use crate::core::job::{Job, JobStatus, JobType};
use crate::core::schedule::JobSchedule;
use crate::core::state::Transition;
use crate::core::types::JobId;
use crate::execution::{ExecutionHandle, ExecutorPool, Lane};
use crate::storage::{JobFilter, JobStore, StorageError};

/// Result of one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Candidates found due.
    pub considered: usize,
    /// Executions started by this tick.
    pub dispatched: Vec<ExecutionHandle>,
}

impl TickReport {
    pub fn dispatched_ids(&self) -> Vec<JobId> {
        self.dispatched.iter().map(|h| h.job_id()).collect()
    }
}

/// Claims due jobs and submits them to the executor pool.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    pool: ExecutorPool,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, pool: ExecutorPool) -> Self {
        Self { store, pool }
    }

    /// Dispatch Scheduled one-time and batch jobs due at `now`.
    pub async fn tick_one_time_at(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let candidates = self
            .store
            .list_jobs(
                &JobFilter::new()
                    .with_status(JobStatus::Scheduled)
                    .with_job_type(JobType::OneTime)
                    .with_job_type(JobType::Batch)
                    .scheduled_before(now),
            )
            .await?;

        let mut report = TickReport {
            considered: candidates.len(),
            ..TickReport::default()
        };
        for job in candidates {
            match self.dispatch_one_time(&job, now).await {
                Ok(handle) => report.dispatched.push(handle),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(job_id = %job.id, reason = %e, "job already claimed");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to dispatch job");
                }
            }
        }

        if !report.dispatched.is_empty() {
            tracing::info!(
                considered = report.considered,
                dispatched = report.dispatched.len(),
                "one-time tick dispatched jobs"
            );
        }
        Ok(report)
    }

    /// Fire recurring schedules due at `now`.
    pub async fn tick_recurring_at(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let mut due = Vec::new();
        for schedule in self.store.due_schedules(now).await? {
            if !schedule.schedule_type.is_recurring() {
                continue;
            }
            match self.store.get_job(&schedule.job_id).await {
                Ok(job) => due.push((schedule, job)),
                Err(e) => {
                    tracing::warn!(job_id = %schedule.job_id, error = %e, "schedule without a loadable job");
                }
            }
        }
        due.sort_by(|(sa, ja), (sb, jb)| {
            jb.priority
                .cmp(&ja.priority)
                .then_with(|| sa.next_execution.cmp(&sb.next_execution))
        });

        let mut report = TickReport {
            considered: due.len(),
            ..TickReport::default()
        };
        for (schedule, job) in due {
            let job_id = job.id;
            match self.fire_recurring(schedule, job, now).await {
                Ok(Some(handle)) => report.dispatched.push(handle),
                Ok(None) => {}
                Err(e) if e.is_conflict() => {
                    tracing::debug!(job_id = %job_id, reason = %e, "recurring job already claimed");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to fire recurring schedule");
                }
            }
        }

        if !report.dispatched.is_empty() {
            tracing::info!(
                considered = report.considered,
                dispatched = report.dispatched.len(),
                "recurring tick dispatched jobs"
            );
        }
        Ok(report)
    }

    pub async fn tick_one_time(&self) -> Result<TickReport, SchedulerError> {
        self.tick_one_time_at(Utc::now()).await
    }

    pub async fn tick_recurring(&self) -> Result<TickReport, SchedulerError> {
        self.tick_recurring_at(Utc::now()).await
    }

    /// Claim and execute a job immediately, outside its schedule.
    ///
    /// Scheduled jobs are dispatched, Retrying jobs skip the rest of their
    /// backoff, and finished recurring jobs are re-armed first.
    pub async fn run_now(&self, job_id: JobId) -> Result<ExecutionHandle, SchedulerError> {
        let now = Utc::now();
        let job = match self.store.get_job(&job_id).await {
            Ok(job) => job,
            Err(StorageError::NotFound(_)) => return Err(SchedulerError::JobNotFound(job_id)),
            Err(e) => return Err(e.into()),
        };

        let claim = match job.status {
            JobStatus::Scheduled => Transition::Dispatch,
            JobStatus::Retrying => Transition::Redispatch,
            JobStatus::Completed | JobStatus::Failed if rearmable(&job) => {
                self.store
                    .transition(&job_id, &Transition::Rearm { next_run: now }, now)
                    .await?;
                Transition::Dispatch
            }
            status => return Err(SchedulerError::NotRunnable { id: job_id, status }),
        };

        let handle = self.pool.claim_and_submit(job_id, claim, Lane::Job).await?;
        tracing::info!(job_id = %job_id, "job dispatched on demand");
        if job.job_type != JobType::Recurring {
            self.consume_one_time_schedule(job_id, now).await;
        }
        Ok(handle)
    }

    async fn dispatch_one_time(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<ExecutionHandle, SchedulerError> {
        let handle = self
            .pool
            .claim_and_submit(job.id, Transition::Dispatch, Lane::Job)
            .await?;
        self.consume_one_time_schedule(job.id, now).await;
        Ok(handle)
    }

    async fn consume_one_time_schedule(&self, job_id: JobId, now: DateTime<Utc>) {
        let result = match self.store.get_schedule(&job_id).await {
            Ok(Some(mut schedule)) if schedule.is_active => {
                if let Err(e) = schedule.record_firing(now) {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to record one-time firing");
                }
                self.store.update_schedule(schedule).await
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(job_id = %job_id, error = %e, "failed to deactivate one-time schedule");
        }
    }

    /// Fire one due occurrence of a recurring schedule.
    ///
    /// The occurrence is claimed by advancing the schedule conditionally on
    /// its stored `next_execution`; a tick holding a stale copy loses with a
    /// conflict even if the job has already finished the occurrence.
    async fn fire_recurring(
        &self,
        mut schedule: JobSchedule,
        job: Job,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionHandle>, SchedulerError> {
        let occurrence = schedule.next_execution;
        let rearm = match job.status {
            JobStatus::Scheduled => false,
            _ if rearmable(&job) => true,
            JobStatus::Cancelled => {
                tracing::info!(job_id = %job.id, "deactivating schedule of cancelled job");
                schedule.deactivate(now);
                self.store.advance_schedule(schedule, occurrence).await?;
                return Ok(None);
            }
            status => {
                tracing::debug!(
                    job_id = %job.id,
                    status = %status,
                    "previous occurrence still in progress, skipping"
                );
                return Ok(None);
            }
        };

        if let Err(e) = schedule.record_firing(now) {
            tracing::warn!(job_id = %job.id, error = %e, "schedule has no further occurrences, deactivated");
        }
        self.store
            .advance_schedule(schedule.clone(), occurrence)
            .await?;
        tracing::debug!(
            job_id = %job.id,
            next_execution = ?schedule.next_execution,
            "recurring schedule advanced"
        );

        if rearm {
            let next_run = occurrence.unwrap_or(now);
            self.store
                .transition(&job.id, &Transition::Rearm { next_run }, now)
                .await?;
        }
        let handle = self
            .pool
            .claim_and_submit(job.id, Transition::Dispatch, Lane::Job)
            .await?;
        Ok(Some(handle))
    }
}

/// A recurring job whose last occurrence has finished for good.
fn rearmable(job: &Job) -> bool {
    job.job_type == JobType::Recurring
        && (job.status == JobStatus::Completed
            || (job.status == JobStatus::Failed && job.exhausted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Outcome;
    use crate::notify::Notifier;
    use crate::queue::InMemoryQueue;
    use crate::storage::InMemoryJobStore;
    use crate::testing::ScriptedRunner;
    use chrono::Duration;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        runner: Arc<ScriptedRunner>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(runner: ScriptedRunner) -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let runner = Arc::new(runner);
        let pool = ExecutorPool::new(
            store.clone(),
            Arc::new(InMemoryQueue::new()),
            runner.clone(),
            Arc::new(Notifier::new()),
        );
        Fixture {
            store: store.clone(),
            runner,
            dispatcher: Arc::new(Dispatcher::new(store, pool)),
        }
    }

    async fn one_time(store: &InMemoryJobStore, name: &str, at: DateTime<Utc>, priority: i32) -> JobId {
        let job = Job::new(name, JobType::OneTime)
            .with_scheduled_at(at)
            .with_priority(priority);
        let id = job.id;
        store.create_job(job).await.unwrap();
        store.save_schedule(JobSchedule::one_time(id, at)).await.unwrap();
        id
    }

    async fn recurring(store: &InMemoryJobStore, expression: &str, created: DateTime<Utc>) -> JobId {
        let schedule_job = Job::new("hourly", JobType::Recurring);
        let id = schedule_job.id;
        let schedule = JobSchedule::recurring(id, expression, "UTC", created).unwrap();
        store
            .create_job(schedule_job.with_scheduled_at(schedule.next_execution.unwrap()))
            .await
            .unwrap();
        store.save_schedule(schedule).await.unwrap();
        id
    }

    async fn wait_all(report: TickReport) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        for handle in report.dispatched {
            outcomes.push(handle.wait().await);
        }
        outcomes
    }

    #[tokio::test]
    async fn test_one_time_tick_dispatches_due_jobs_in_priority_order() {
        let f = fixture(ScriptedRunner::succeeding());
        let now = Utc::now();
        let low = one_time(&f.store, "low", now - Duration::minutes(5), 0).await;
        let high = one_time(&f.store, "high", now - Duration::minutes(1), 10).await;
        let future = one_time(&f.store, "future", now + Duration::hours(1), 99).await;

        let report = f.dispatcher.tick_one_time_at(now).await.unwrap();

        assert_eq!(report.considered, 2);
        assert_eq!(report.dispatched_ids(), vec![high, low]);
        wait_all(report).await;
        assert_eq!(
            f.store.get_job(&future).await.unwrap().status,
            JobStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn test_one_time_schedule_deactivated_after_firing() {
        let f = fixture(ScriptedRunner::succeeding());
        let now = Utc::now();
        let id = one_time(&f.store, "report", now - Duration::seconds(1), 0).await;

        let report = f.dispatcher.tick_one_time_at(now).await.unwrap();
        assert_eq!(wait_all(report).await, vec![Outcome::Success]);

        let schedule = f.store.get_schedule(&id).await.unwrap().unwrap();
        assert!(!schedule.is_active);
        assert_eq!(schedule.last_execution, Some(now));

        let again = f.dispatcher.tick_one_time_at(now + Duration::hours(1)).await.unwrap();
        assert_eq!(again.considered, 0);
        assert_eq!(f.runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ticks_dispatch_once() {
        let f = fixture(ScriptedRunner::succeeding());
        let now = Utc::now();
        one_time(&f.store, "report", now - Duration::seconds(1), 0).await;

        let mut ticks = Vec::new();
        for _ in 0..8 {
            let dispatcher = Arc::clone(&f.dispatcher);
            ticks.push(tokio::spawn(async move {
                dispatcher.tick_one_time_at(now).await.unwrap()
            }));
        }
        let mut dispatched = 0;
        for tick in ticks {
            let report = tick.await.unwrap();
            dispatched += report.dispatched.len();
            wait_all(report).await;
        }

        assert_eq!(dispatched, 1);
        assert_eq!(f.runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_recurring_tick_advances_schedule() {
        let f = fixture(ScriptedRunner::succeeding());
        let created = Utc::now() - Duration::minutes(10);
        let id = recurring(&f.store, "@every 1m", created).await;
        let now = Utc::now();

        let report = f.dispatcher.tick_recurring_at(now).await.unwrap();
        assert_eq!(wait_all(report).await, vec![Outcome::Success]);

        let schedule = f.store.get_schedule(&id).await.unwrap().unwrap();
        assert!(schedule.is_active);
        assert_eq!(schedule.last_execution, Some(now));
        assert!(schedule.next_execution.unwrap() > now);
        assert_eq!(
            f.store.get_job(&id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_recurring_job_is_rearmed_for_next_occurrence() {
        let f = fixture(ScriptedRunner::succeeding());
        let created = Utc::now() - Duration::minutes(10);
        let id = recurring(&f.store, "@every 1m", created).await;
        let first = Utc::now();

        wait_all(f.dispatcher.tick_recurring_at(first).await.unwrap()).await;
        let second = first + Duration::minutes(2);
        let report = f.dispatcher.tick_recurring_at(second).await.unwrap();
        assert_eq!(wait_all(report).await, vec![Outcome::Success]);

        assert_eq!(f.runner.call_count(), 2);
        let schedule = f.store.get_schedule(&id).await.unwrap().unwrap();
        assert_eq!(schedule.last_execution, Some(second));
        assert!(schedule.next_execution.unwrap() > second);
    }

    #[tokio::test]
    async fn test_recurring_occurrence_skipped_while_running() {
        let f = fixture(ScriptedRunner::succeeding());
        let id = recurring(&f.store, "@every 1m", Utc::now() - Duration::minutes(10)).await;
        f.store
            .transition(&id, &Transition::Dispatch, Utc::now())
            .await
            .unwrap();
        let before = f.store.get_schedule(&id).await.unwrap().unwrap();

        let report = f.dispatcher.tick_recurring_at(Utc::now()).await.unwrap();

        assert!(report.dispatched.is_empty());
        assert_eq!(f.store.get_schedule(&id).await.unwrap().unwrap(), before);
        assert_eq!(f.runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_schedule_cannot_refire_finished_occurrence() {
        let f = fixture(ScriptedRunner::succeeding());
        let id = recurring(&f.store, "@every 1h", Utc::now() - Duration::hours(2)).await;
        let now = Utc::now();
        let stale = f.store.due_schedules(now).await.unwrap().remove(0);

        let report = f.dispatcher.tick_recurring_at(now).await.unwrap();
        assert_eq!(wait_all(report).await, vec![Outcome::Success]);
        let advanced = f.store.get_schedule(&id).await.unwrap().unwrap();

        let finished = f.store.get_job(&id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        let err = f
            .dispatcher
            .fire_recurring(stale, finished, now)
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(f.runner.call_count(), 1);
        assert_eq!(f.store.get_schedule(&id).await.unwrap().unwrap(), advanced);
        assert_eq!(
            f.store.get_job(&id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_concurrent_recurring_ticks_fire_once() {
        let f = fixture(ScriptedRunner::succeeding());
        recurring(&f.store, "@every 1h", Utc::now() - Duration::hours(2)).await;
        let now = Utc::now();

        let mut ticks = Vec::new();
        for _ in 0..8 {
            let dispatcher = Arc::clone(&f.dispatcher);
            ticks.push(tokio::spawn(async move {
                dispatcher.tick_recurring_at(now).await.unwrap()
            }));
        }
        let mut dispatched = 0;
        for tick in ticks {
            let report = tick.await.unwrap();
            dispatched += report.dispatched.len();
            wait_all(report).await;
        }

        assert_eq!(dispatched, 1);
        assert_eq!(f.runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_not_dispatched() {
        let f = fixture(ScriptedRunner::succeeding());
        let now = Utc::now();
        let id = one_time(&f.store, "report", now - Duration::seconds(1), 0).await;
        f.store.transition(&id, &Transition::Cancel, now).await.unwrap();

        let report = f.dispatcher.tick_one_time_at(now).await.unwrap();

        assert!(report.dispatched.is_empty());
        assert_eq!(f.runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_now_dispatches_future_job() {
        let f = fixture(ScriptedRunner::succeeding());
        let id = one_time(&f.store, "later", Utc::now() + Duration::hours(1), 0).await;

        let outcome = f.dispatcher.run_now(id).await.unwrap().wait().await;

        assert_eq!(outcome, Outcome::Success);
        assert!(!f.store.get_schedule(&id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_run_now_rejects_finished_one_time_job() {
        let f = fixture(ScriptedRunner::succeeding());
        let id = one_time(&f.store, "report", Utc::now(), 0).await;
        f.dispatcher.run_now(id).await.unwrap().wait().await;

        let err = f.dispatcher.run_now(id).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::NotRunnable {
                status: JobStatus::Completed,
                ..
            }
        ));

        let missing = f.dispatcher.run_now(JobId::new()).await.unwrap_err();
        assert!(matches!(missing, SchedulerError::JobNotFound(_)));
    }
}
