//! Cancellation through the scheduler handle.

use cadence::testing::{ScriptedRunner, TestHarness};
use cadence::{Job, JobId, JobService, JobStatus, JobStore, JobType, SchedulerError, Trigger};
use chrono::{Duration, Utc};
use std::time::Duration as StdDuration;

use crate::common::{WAIT, log_messages, wait_for_status};

#[tokio::test]
async fn test_cancelled_job_is_never_dispatched() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let job = JobService::new(harness.store.clone())
        .create_one_time(Job::new("newsletter", JobType::OneTime), Utc::now())
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    let cancelled = handle.cancel(job.id).await.unwrap();

    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    let schedule = harness.store.get_schedule(&job.id).await.unwrap().unwrap();
    assert!(!schedule.is_active);
    assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 0);
    assert_eq!(harness.runner.call_count(), 0);
    assert_eq!(
        log_messages(harness.store.as_ref(), &job.id).await,
        vec!["Job cancelled"]
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_recurring_job_stops_firing() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let job = JobService::new(harness.store.clone())
        .create_recurring(Job::new("digest", JobType::Recurring), "@every 10m", None)
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    handle.cancel(job.id).await.unwrap();
    let mut schedule = harness.store.get_schedule(&job.id).await.unwrap().unwrap();
    schedule.next_execution = Some(Utc::now() - Duration::seconds(1));
    harness.store.update_schedule(schedule).await.unwrap();

    assert_eq!(handle.tick(Trigger::Recurring).await.unwrap(), 0);
    let stored = harness.store.get_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_running_job_cannot_be_cancelled() {
    let harness = TestHarness::new(
        ScriptedRunner::succeeding().with_delay(StdDuration::from_millis(300)),
    );
    let job = JobService::new(harness.store.clone())
        .create_one_time(Job::new("busy", JobType::OneTime), Utc::now())
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    handle.tick(Trigger::OneTime).await.unwrap();
    wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Running, WAIT).await;

    let result = handle.cancel(job.id).await;
    assert!(result.unwrap_err().is_conflict());

    wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let (handle, _task) = harness.scheduler().start().await;

    let result = handle.cancel(JobId::new()).await;

    assert!(matches!(result, Err(SchedulerError::JobNotFound(_))));
    handle.shutdown().await.unwrap();
}
