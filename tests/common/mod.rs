//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use cadence::{ExecutionLog, Job, JobId, JobStatus, JobStore, LogLevel};
use std::time::Duration;

/// Default time a test waits for the engine to make progress.
pub const WAIT: Duration = Duration::from_secs(5);

/// Wait for a job to reach an expected status, polling the store.
///
/// This is more reliable than fixed sleeps since execution time can vary.
/// Polls the store every 10ms.
///
/// # Panics
///
/// Panics if the timeout is reached before the job reaches the expected status.
pub async fn wait_for_status(
    store: &dyn JobStore,
    id: &JobId,
    expected: JobStatus,
    timeout: Duration,
) -> Job {
    wait_for_job(store, id, timeout, |job| job.status == expected).await
}

/// Wait until `predicate` holds for the stored job.
pub async fn wait_for_job(
    store: &dyn JobStore,
    id: &JobId,
    timeout: Duration,
    predicate: impl Fn(&Job) -> bool,
) -> Job {
    let start = tokio::time::Instant::now();
    loop {
        let job = store.get_job(id).await.unwrap();
        if predicate(&job) {
            return job;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for job {}, current status: {} (retry {}/{}, exhausted: {})",
                id, job.status, job.current_retry_count, job.max_retries, job.exhausted
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the job has been dead-lettered.
pub async fn wait_for_dead_letter(store: &dyn JobStore, id: &JobId) -> Job {
    wait_for_job(store, id, WAIT, |job| {
        job.status == JobStatus::Failed && job.exhausted
    })
    .await
}

/// Messages of the job's execution log, oldest first.
pub async fn log_messages(store: &dyn JobStore, id: &JobId) -> Vec<String> {
    store
        .list_logs(id)
        .await
        .unwrap()
        .into_iter()
        .map(|log| log.message)
        .collect()
}

/// Log entries at `level`.
pub async fn logs_at(store: &dyn JobStore, id: &JobId, level: LogLevel) -> Vec<ExecutionLog> {
    store
        .list_logs(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|log| log.level == level)
        .collect()
}

/// Wait until `hook` has received `count` notifications of `kind`.
pub async fn wait_for_notifications(
    hook: &cadence::testing::RecordingHook,
    kind: cadence::NotificationKind,
    count: usize,
) -> Vec<cadence::Notification> {
    let start = tokio::time::Instant::now();
    loop {
        let received = hook.of_kind(kind).await;
        if received.len() >= count {
            return received;
        }
        if start.elapsed() > WAIT {
            panic!("expected {} {} notification(s), got {}", count, kind, received.len());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
