//! Stuck job detection through the running engine.

use cadence::testing::{ScriptedRunner, TestHarness};
use cadence::{
    Job, JobService, JobStatus, JobStore, JobType, LogLevel, NotificationKind, Transition, Trigger,
};
use chrono::{Duration, Utc};

use crate::common::{logs_at, wait_for_notifications};

/// Create a job and mark it Running as of `minutes_ago`.
async fn running_since(harness: &TestHarness, name: &str, minutes_ago: i64) -> Job {
    let job = JobService::new(harness.store.clone())
        .create_one_time(
            Job::new(name, JobType::OneTime),
            Utc::now() + Duration::days(1),
        )
        .await
        .unwrap();
    harness
        .store
        .transition(
            &job.id,
            &Transition::Dispatch,
            Utc::now() - Duration::minutes(minutes_ago),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_stuck_job_is_force_failed() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let stuck = running_since(&harness, "hung-export", 45).await;
    let healthy = running_since(&harness, "long-import", 10).await;
    let (handle, _task) = harness.scheduler().start().await;

    assert_eq!(handle.tick(Trigger::StuckJobs).await.unwrap(), 1);

    let failed = harness.store.get_job(&stuck.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.exhausted);
    assert!(failed.error_message.as_deref().unwrap().contains("stuck timeout"));

    let errors = logs_at(harness.store.as_ref(), &stuck.id, LogLevel::Error).await;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].details.as_deref().unwrap().contains("timeout 1800s"));

    let untouched = harness.store.get_job(&healthy.id).await.unwrap();
    assert_eq!(untouched.status, JobStatus::Running);

    let notified = wait_for_notifications(&harness.hook, NotificationKind::StuckJob, 1).await;
    assert_eq!(notified[0].job.id, stuck.id);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_force_failed_job_is_not_retried() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let stuck = running_since(&harness, "hung", 90).await;
    let (handle, _task) = harness.scheduler().start().await;

    assert_eq!(handle.tick(Trigger::StuckJobs).await.unwrap(), 1);
    assert_eq!(handle.tick(Trigger::RetrySweep).await.unwrap(), 0);
    assert_eq!(handle.tick(Trigger::StuckJobs).await.unwrap(), 0);

    let job = harness.store.get_job(&stuck.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.current_retry_count, 0);
    assert_eq!(harness.runner.call_count(), 0);
    handle.shutdown().await.unwrap();
}
