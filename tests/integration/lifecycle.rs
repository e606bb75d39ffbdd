//! End-to-end lifecycle tests.
//!
//! Jobs are created through the service, dispatched by a running scheduler,
//! and observed through the store and the notification hook.

use cadence::testing::{ScriptedRunner, TestHarness};
use cadence::{
    CommandSpec, Job, JobService, JobStatus, JobType, LogLevel, NotificationKind, Outcome,
    Scheduler, SchedulerSettings, Trigger,
};
use chrono::Utc;
use std::sync::Arc;

use crate::common::{WAIT, log_messages, logs_at, wait_for_notifications, wait_for_status};

#[tokio::test]
async fn test_successful_job_completes_with_logs_and_notification() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let job = JobService::new(harness.store.clone())
        .create_one_time(Job::new("send-report", JobType::OneTime), Utc::now())
        .await
        .unwrap();
    let (handle, task) = harness.scheduler().start().await;

    assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 1);
    let done = wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;

    assert!(done.started_at.is_some());
    assert!(done.completed_at.unwrap() >= done.started_at.unwrap());
    assert_eq!(done.current_retry_count, 0);
    wait_for_notifications(&harness.hook, NotificationKind::JobCompleted, 1).await;
    assert_eq!(
        log_messages(harness.store.as_ref(), &job.id).await,
        vec!["Job execution started", "Job completed successfully"]
    );
    let started = &logs_at(harness.store.as_ref(), &job.id, LogLevel::Info).await[0];
    assert!(started.worker.as_deref().unwrap().starts_with("job-worker-"));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_panicking_job_never_stays_running() {
    let harness = TestHarness::new(ScriptedRunner::panicking());
    let job = JobService::new(harness.store.clone())
        .create_one_time(
            Job::new("explodes", JobType::OneTime).with_max_retries(0),
            Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    let outcome = handle.run_now(job.id).await.unwrap();

    assert!(matches!(outcome, Outcome::Failure(ref reason) if reason.contains("panicked")));
    let failed = wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Failed, WAIT).await;
    assert!(failed.error_message.is_some());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_batch_jobs_run_on_the_one_time_trigger() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let service = JobService::new(harness.store.clone());
    let mut ids = Vec::new();
    for i in 0..5 {
        let job = service
            .create_batch(Job::new(format!("import-{}", i), JobType::Batch), Utc::now())
            .await
            .unwrap();
        ids.push(job.id);
    }
    let (handle, _task) = harness.scheduler().start().await;

    assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 5);
    for id in &ids {
        wait_for_status(harness.store.as_ref(), id, JobStatus::Completed, WAIT).await;
    }
    assert_eq!(harness.runner.call_count(), 5);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_command_runner_end_to_end() {
    let store = Arc::new(cadence::InMemoryJobStore::new());
    let payload = CommandSpec::new("sh")
        .with_args(["-c", "exit 0"])
        .to_payload()
        .unwrap();
    let job = JobService::new(store.clone())
        .create_one_time(
            Job::new("shell", JobType::OneTime).with_payload(payload),
            Utc::now(),
        )
        .await
        .unwrap();
    let scheduler =
        Scheduler::with_store(store.clone()).with_settings(SchedulerSettings::for_tests());
    let (handle, _task) = scheduler.start().await;

    handle.tick(Trigger::OneTime).await.unwrap();

    wait_for_status(store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;
    handle.shutdown().await.unwrap();
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_lifecycle_on_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        cadence::SqliteJobStore::new(dir.path().join("cadence.db"))
            .await
            .unwrap(),
    );
    let job = JobService::new(store.clone())
        .create_one_time(
            Job::new("persisted", JobType::OneTime).with_max_retries(1),
            Utc::now(),
        )
        .await
        .unwrap();
    let runner = Arc::new(ScriptedRunner::failing_times(1));
    let scheduler = Scheduler::with_store(store.clone())
        .with_runner(runner.clone())
        .with_settings(SchedulerSettings::for_tests());
    let (handle, _task) = scheduler.start().await;

    handle.tick(Trigger::OneTime).await.unwrap();

    let done = wait_for_status(store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;
    assert_eq!(done.current_retry_count, 1);
    assert_eq!(runner.call_count(), 2);
    assert!(
        log_messages(store.as_ref(), &job.id)
            .await
            .contains(&"Retrying job execution (attempt 1)".to_string())
    );
    handle.shutdown().await.unwrap();
}
