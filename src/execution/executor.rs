//! Bounded executor pool.
//!
//! The `ExecutorPool` runs claimed jobs with:
//! - Two separately bounded lanes, one for fresh dispatches and one for retries
//! - Panic isolation around the job body
//! - Completion/failure transitions, execution logs and failure events

use chrono::Utc;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::runner::JobRunner;
use crate::core::job::{Job, JobStatus};
use crate::core::log::ExecutionLog;
use crate::core::state::Transition;
use crate::core::types::JobId;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::queue::{FailureEvent, MessageQueue, publish_event};
use crate::storage::{JobStore, StorageError};

/// Default size of the job lane.
pub const DEFAULT_JOB_WORKERS: usize = 10;

/// Default size of the retry lane.
pub const DEFAULT_RETRY_WORKERS: usize = 5;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors raised before an execution starts.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("could not claim job: {0}")]
    Claim(#[from] StorageError),

    #[error("claim transition must be Dispatch or Redispatch, got {0}")]
    NotAClaim(&'static str),
}

/// Execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Scheduled and run-now dispatches.
    Job,
    /// Retry-triggered dispatches.
    Retry,
}

impl Lane {
    fn worker_prefix(&self) -> &'static str {
        match self {
            Lane::Job => "job-worker",
            Lane::Retry => "retry-worker",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Job => f.write_str("job"),
            Lane::Retry => f.write_str("retry"),
        }
    }
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Handle to a submitted execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    job_id: JobId,
    lane: Lane,
    inner: JoinHandle<Outcome>,
}

impl ExecutionHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Wait for the execution to finish.
    pub async fn wait(self) -> Outcome {
        match self.inner.await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failure(format!("execution task ended abnormally: {}", e)),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pool executing claimed jobs on two bounded lanes.
///
/// Cloning is cheap; clones share lanes and counters.
#[derive(Clone)]
pub struct ExecutorPool {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn MessageQueue>,
    runner: Arc<dyn JobRunner>,
    notifier: Arc<Notifier>,
    job_workers: usize,
    retry_workers: usize,
    job_lane: Arc<Semaphore>,
    retry_lane: Arc<Semaphore>,
    job_seq: Arc<AtomicUsize>,
    retry_seq: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl ExecutorPool {
    /// Create a pool with the default lane sizes.
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn MessageQueue>,
        runner: Arc<dyn JobRunner>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            queue,
            runner,
            notifier,
            job_workers: DEFAULT_JOB_WORKERS,
            retry_workers: DEFAULT_RETRY_WORKERS,
            job_lane: Arc::new(Semaphore::new(DEFAULT_JOB_WORKERS)),
            retry_lane: Arc::new(Semaphore::new(DEFAULT_RETRY_WORKERS)),
            job_seq: Arc::new(AtomicUsize::new(0)),
            retry_seq: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the lane sizes. Zero is raised to one.
    pub fn with_workers(mut self, job_workers: usize, retry_workers: usize) -> Self {
        self.job_workers = job_workers.max(1);
        self.retry_workers = retry_workers.max(1);
        self.job_lane = Arc::new(Semaphore::new(self.job_workers));
        self.retry_lane = Arc::new(Semaphore::new(self.retry_workers));
        self
    }

    /// Size of a lane.
    pub fn workers(&self, lane: Lane) -> usize {
        match lane {
            Lane::Job => self.job_workers,
            Lane::Retry => self.retry_workers,
        }
    }

    /// Free slots on a lane.
    pub fn available_permits(&self, lane: Lane) -> usize {
        self.semaphore(lane).available_permits()
    }

    /// Executions submitted and not yet finished, including queued ones.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim a job with `claim` and submit it to `lane`.
    ///
    /// The claim is a conditional update; if another caller won the race
    /// the error reports a conflict and nothing is submitted.
    pub async fn claim_and_submit(
        &self,
        job_id: JobId,
        claim: Transition,
        lane: Lane,
    ) -> Result<ExecutionHandle, ExecutionError> {
        if !matches!(claim, Transition::Dispatch | Transition::Redispatch) {
            return Err(ExecutionError::NotAClaim(claim.name()));
        }
        self.store.transition(&job_id, &claim, Utc::now()).await?;
        Ok(self.submit(job_id, lane))
    }

    /// Submit a job that is already Running.
    pub fn submit(&self, job_id: JobId, lane: Lane) -> ExecutionHandle {
        let pool = self.clone();
        let guard = ActiveGuard::new(&self.active);
        let inner = tokio::spawn(async move {
            let _guard = guard;
            pool.execute(job_id, lane).await
        });

        ExecutionHandle {
            job_id,
            lane,
            inner,
        }
    }

    /// Wait until no execution is active. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    fn semaphore(&self, lane: Lane) -> &Arc<Semaphore> {
        match lane {
            Lane::Job => &self.job_lane,
            Lane::Retry => &self.retry_lane,
        }
    }

    fn worker_name(&self, lane: Lane) -> String {
        let (seq, size) = match lane {
            Lane::Job => (&self.job_seq, self.job_workers),
            Lane::Retry => (&self.retry_seq, self.retry_workers),
        };
        let n = seq.fetch_add(1, Ordering::Relaxed) % size + 1;
        format!("{}-{}", lane.worker_prefix(), n)
    }

    async fn execute(&self, job_id: JobId, lane: Lane) -> Outcome {
        let Ok(_permit) = Arc::clone(self.semaphore(lane)).acquire_owned().await else {
            return Outcome::Failure("executor pool closed".into());
        };
        let worker = self.worker_name(lane);

        let job = match self.store.get_job(&job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "could not load job for execution");
                return Outcome::Failure(e.to_string());
            }
        };
        // The job may have been force-failed while it waited for a permit.
        if job.status != JobStatus::Running {
            tracing::debug!(job_id = %job_id, status = %job.status, "job no longer running, skipping");
            return Outcome::Failure(format!("job is {}, not running", job.status));
        }

        self.append_log(
            ExecutionLog::info(job_id, "Job execution started")
                .with_details(format!("attempt {} on {} lane", job.current_retry_count + 1, lane))
                .with_worker(&worker),
        )
        .await;
        tracing::info!(job_id = %job_id, job_name = %job.name, worker = %worker, "job execution started");

        let started = Instant::now();
        let runner = Arc::clone(&self.runner);
        let body = job.clone();
        let result = match tokio::spawn(async move { runner.run(&body).await }).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) if e.is_panic() => Err(format!("job panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Err(format!("job body cancelled: {}", e)),
        };
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.record_success(&job, &worker, elapsed).await;
                Outcome::Success
            }
            Err(reason) => {
                self.record_failure(&job, &worker, elapsed, &reason).await;
                Outcome::Failure(reason)
            }
        }
    }

    async fn record_success(&self, job: &Job, worker: &str, elapsed: Duration) {
        match self
            .store
            .transition(&job.id, &Transition::Complete, Utc::now())
            .await
        {
            Ok(completed) => {
                self.append_log(
                    ExecutionLog::info(job.id, "Job completed successfully")
                        .with_duration(elapsed)
                        .with_worker(worker),
                )
                .await;
                tracing::info!(job_id = %job.id, duration_ms = elapsed.as_millis() as u64, "job completed");
                self.notifier
                    .send(Notification::new(NotificationKind::JobCompleted, completed))
                    .await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "could not record job completion");
            }
        }
    }

    async fn record_failure(&self, job: &Job, worker: &str, elapsed: Duration, reason: &str) {
        let now = Utc::now();
        let failed = match self
            .store
            .transition(
                &job.id,
                &Transition::Fail {
                    error: reason.to_string(),
                },
                now,
            )
            .await
        {
            Ok(failed) => failed,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "could not record job failure");
                return;
            }
        };

        self.append_log(
            ExecutionLog::error(job.id, "Job execution failed")
                .with_details(reason)
                .with_duration(elapsed)
                .with_worker(worker),
        )
        .await;
        tracing::warn!(
            job_id = %job.id,
            retry_count = failed.current_retry_count,
            max_retries = failed.max_retries,
            error = %reason,
            "job execution failed"
        );

        let event = FailureEvent::from_job(&failed, reason, now);
        if let Err(e) = publish_event(self.queue.as_ref(), &event).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to publish failure event");
        }

        self.notifier
            .send(Notification::new(NotificationKind::JobFailed, failed).with_details(reason))
            .await;
    }

    async fn append_log(&self, log: ExecutionLog) {
        let job_id = log.job_id;
        if let Err(e) = self.store.append_log(log).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to append execution log");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
