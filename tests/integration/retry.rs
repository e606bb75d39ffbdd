//! Retry pipeline and dead-letter tests.

use cadence::testing::{ScriptedRunner, TestHarness};
use cadence::{
    BackoffPolicy, Job, JobService, JobStatus, JobStore, JobType, LogLevel, NotificationKind,
    Trigger,
};
use chrono::Utc;
use std::time::Duration;

use crate::common::{WAIT, logs_at, wait_for_dead_letter, wait_for_notifications, wait_for_status};

#[tokio::test]
async fn test_always_failing_job_ends_in_dead_letter() {
    let harness = TestHarness::new(ScriptedRunner::always_failing("connection refused"));
    let job = JobService::new(harness.store.clone())
        .create_one_time(
            Job::new("sync-ledger", JobType::OneTime).with_max_retries(2),
            Utc::now(),
        )
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    handle.tick(Trigger::OneTime).await.unwrap();
    let dead = wait_for_dead_letter(harness.store.as_ref(), &job.id).await;

    assert_eq!(dead.status, JobStatus::Failed);
    assert_eq!(dead.current_retry_count, 2);
    assert!(dead.error_message.as_deref().unwrap().contains("connection refused"));
    assert_eq!(harness.runner.call_count(), 3);

    let retries: Vec<String> = logs_at(harness.store.as_ref(), &job.id, LogLevel::Warn)
        .await
        .into_iter()
        .map(|log| log.message)
        .collect();
    assert_eq!(
        retries,
        vec![
            "Retrying job execution (attempt 1)",
            "Retrying job execution (attempt 2)"
        ]
    );

    let notified = wait_for_notifications(&harness.hook, NotificationKind::DeadLettered, 1).await;
    assert_eq!(notified[0].job.id, job.id);

    let records = harness.store.list_dead_letters().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, job.id);
    assert_eq!(records[0].final_retry_count, 2);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flaky_job_recovers_on_retry_lane() {
    let harness = TestHarness::new(ScriptedRunner::failing_times(2));
    let job = JobService::new(harness.store.clone())
        .create_one_time(
            Job::new("flaky", JobType::OneTime).with_max_retries(3),
            Utc::now(),
        )
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    handle.tick(Trigger::OneTime).await.unwrap();
    let done = wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;

    assert_eq!(done.current_retry_count, 2);
    assert!(!done.exhausted);
    assert!(done.error_message.is_none());
    assert!(harness.store.list_dead_letters().await.unwrap().is_empty());

    let errors = logs_at(harness.store.as_ref(), &job.id, LogLevel::Error).await;
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|log| log.message == "Job execution failed"));
    let started: Vec<_> = logs_at(harness.store.as_ref(), &job.id, LogLevel::Info)
        .await
        .into_iter()
        .filter(|log| log.message == "Job execution started")
        .collect();
    assert_eq!(started.len(), 3);
    assert!(started[0].worker.as_deref().unwrap().starts_with("job-worker-"));
    assert!(started[2].worker.as_deref().unwrap().starts_with("retry-worker-"));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_zero_retry_budget_goes_straight_to_dead_letter() {
    let harness = TestHarness::new(ScriptedRunner::always_failing("bad input"));
    let job = JobService::new(harness.store.clone())
        .create_one_time(
            Job::new("once", JobType::OneTime).with_max_retries(0),
            Utc::now(),
        )
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    handle.tick(Trigger::OneTime).await.unwrap();
    let dead = wait_for_dead_letter(harness.store.as_ref(), &job.id).await;

    assert_eq!(dead.current_retry_count, 0);
    assert_eq!(harness.runner.call_count(), 1);
    assert!(logs_at(harness.store.as_ref(), &job.id, LogLevel::Warn).await.is_empty());
    handle.shutdown().await.unwrap();
}

#[test]
fn test_default_backoff_schedule() {
    let policy = BackoffPolicy::default();

    assert_eq!(policy.delay_ms_for(0), 5_000);
    assert_eq!(policy.delay_ms_for(1), 10_000);
    assert_eq!(policy.delay_ms_for(3), 40_000);
    assert_eq!(policy.delay_ms_for(5), 160_000);
    assert_eq!(policy.delay_ms_for(6), 300_000);
    assert_eq!(policy.delay_ms_for(40), 300_000);
    assert_eq!(policy.delay_for(2), Duration::from_secs(20));
}
