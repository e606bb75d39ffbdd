//! Scheduling tests: claims, recurring schedules and run-now.

use cadence::testing::{ScriptedRunner, TestHarness};
use cadence::{
    Job, JobId, JobService, JobStatus, JobStore, JobType, SchedulerError, Trigger,
};
use chrono::{Duration, Utc};
use std::time::Duration as StdDuration;
use tokio::task::JoinSet;

use crate::common::{WAIT, wait_for_status};

/// Pull the job's schedule into the past so the next recurring tick sees it.
async fn make_due(store: &dyn JobStore, id: &JobId) {
    let mut schedule = store.get_schedule(id).await.unwrap().unwrap();
    schedule.next_execution = Some(Utc::now() - Duration::seconds(1));
    store.update_schedule(schedule).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_ticks_dispatch_each_job_once() {
    let harness = TestHarness::new(
        ScriptedRunner::succeeding().with_delay(StdDuration::from_millis(50)),
    );
    let service = JobService::new(harness.store.clone());
    let mut ids = Vec::new();
    for i in 0..10 {
        let job = service
            .create_one_time(Job::new(format!("job-{}", i), JobType::OneTime), Utc::now())
            .await
            .unwrap();
        ids.push(job.id);
    }
    let (handle, _task) = harness.scheduler().start().await;

    let mut ticks = JoinSet::new();
    for _ in 0..6 {
        let handle = handle.clone();
        ticks.spawn(async move { handle.tick(Trigger::OneTime).await.unwrap() });
    }
    let dispatched: usize = ticks.join_all().await.into_iter().sum();

    assert_eq!(dispatched, 10);
    for id in &ids {
        wait_for_status(harness.store.as_ref(), id, JobStatus::Completed, WAIT).await;
    }
    assert_eq!(harness.runner.call_count(), 10);

    let mut called = harness.runner.calls().await;
    called.sort();
    called.dedup();
    assert_eq!(called.len(), 10);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_future_jobs_wait_for_their_time() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let job = JobService::new(harness.store.clone())
        .create_one_time(
            Job::new("tomorrow", JobType::OneTime),
            Utc::now() + Duration::days(1),
        )
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 0);
    let stored = harness.store.get_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Scheduled);
    assert_eq!(harness.runner.call_count(), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_one_time_schedule_is_consumed() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let job = JobService::new(harness.store.clone())
        .create_one_time(Job::new("once", JobType::OneTime), Utc::now())
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 1);
    wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;

    let schedule = harness.store.get_schedule(&job.id).await.unwrap().unwrap();
    assert!(!schedule.is_active);
    assert!(schedule.last_execution.is_some());
    assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 0);
    assert_eq!(handle.tick(Trigger::Recurring).await.unwrap(), 0);
    assert_eq!(harness.runner.call_count(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recurring_job_rearms_after_completion() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let job = JobService::new(harness.store.clone())
        .create_recurring(Job::new("hourly", JobType::Recurring), "0 0 * * * *", None)
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    // Not due yet.
    assert_eq!(handle.tick(Trigger::Recurring).await.unwrap(), 0);

    make_due(harness.store.as_ref(), &job.id).await;
    assert_eq!(handle.tick(Trigger::Recurring).await.unwrap(), 1);
    wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;

    let schedule = harness.store.get_schedule(&job.id).await.unwrap().unwrap();
    assert!(schedule.is_active);
    assert!(schedule.next_execution.unwrap() > Utc::now());
    assert!(schedule.last_execution.is_some());

    make_due(harness.store.as_ref(), &job.id).await;
    assert_eq!(handle.tick(Trigger::Recurring).await.unwrap(), 1);
    wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;

    assert_eq!(harness.runner.call_count(), 2);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recurring_occurrence_skipped_while_running() {
    let harness = TestHarness::new(
        ScriptedRunner::succeeding().with_delay(StdDuration::from_millis(300)),
    );
    let job = JobService::new(harness.store.clone())
        .create_recurring(Job::new("slow", JobType::Recurring), "@every 1h", None)
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    make_due(harness.store.as_ref(), &job.id).await;
    assert_eq!(handle.tick(Trigger::Recurring).await.unwrap(), 1);
    wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Running, WAIT).await;

    make_due(harness.store.as_ref(), &job.id).await;
    assert_eq!(handle.tick(Trigger::Recurring).await.unwrap(), 0);

    wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;
    assert_eq!(harness.runner.call_count(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_run_now_ignores_the_schedule() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let job = JobService::new(harness.store.clone())
        .create_one_time(
            Job::new("later", JobType::OneTime),
            Utc::now() + Duration::hours(6),
        )
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    let outcome = handle.run_now(job.id).await.unwrap();

    assert!(outcome.is_success());
    let stored = harness.store.get_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(!harness.store.get_schedule(&job.id).await.unwrap().unwrap().is_active);

    let again = handle.run_now(job.id).await;
    assert!(matches!(again, Err(SchedulerError::NotRunnable { .. })));

    let missing = handle.run_now(JobId::new()).await;
    assert!(matches!(missing, Err(SchedulerError::JobNotFound(_))));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_paused_engine_still_accepts_manual_ticks() {
    let harness = TestHarness::new(ScriptedRunner::succeeding());
    let job = JobService::new(harness.store.clone())
        .create_one_time(Job::new("manual", JobType::OneTime), Utc::now())
        .await
        .unwrap();
    let (handle, _task) = harness.scheduler().start().await;

    handle.pause().await.unwrap();
    assert!(handle.is_paused().await);
    assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 1);
    wait_for_status(harness.store.as_ref(), &job.id, JobStatus::Completed, WAIT).await;

    handle.resume().await.unwrap();
    assert!(handle.is_running().await);
    handle.shutdown().await.unwrap();
}
