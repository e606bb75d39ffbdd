//! Periodic repair of the failure pipeline.
//!
//! Queue publishes can fail, and retry timers die with the process. The sweep
//! republishes failure events for Failed jobs that never got routed and
//! resubmits Retrying jobs whose timer should have fired long ago.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::PipelineError;
use crate::core::job::JobStatus;
use crate::core::retry::BackoffPolicy;
use crate::core::state::Transition;
use crate::execution::{ExecutionError, ExecutorPool, Lane};
use crate::queue::{FailureEvent, MessageQueue, publish_event};
use crate::storage::{JobFilter, JobStore};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub republished: usize,
    pub redispatched: usize,
}

/// Retry sweep over the store.
pub struct RetrySweep {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn MessageQueue>,
    pool: ExecutorPool,
    interval: Duration,
    backoff: BackoffPolicy,
}

impl RetrySweep {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn MessageQueue>,
        pool: ExecutorPool,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            pool,
            interval,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run one sweep as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, PipelineError> {
        let mut report = SweepReport::default();
        let interval = to_chrono(self.interval);

        let unrouted = self
            .store
            .list_jobs(
                &JobFilter::new()
                    .with_status(JobStatus::Failed)
                    .with_exhausted(false)
                    .updated_before(now - interval),
            )
            .await?;
        for job in unrouted {
            let reason = job.error_message.clone().unwrap_or_default();
            let event = FailureEvent::from_job(&job, reason, now);
            match publish_event(self.queue.as_ref(), &event).await {
                Ok(()) => report.republished += 1,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to republish failure event");
                }
            }
        }

        let stalled = self
            .store
            .list_jobs(
                &JobFilter::new()
                    .with_status(JobStatus::Retrying)
                    .updated_before(now - interval - to_chrono(self.backoff.max_delay)),
            )
            .await?;
        for job in stalled {
            match self
                .pool
                .claim_and_submit(job.id, Transition::Redispatch, Lane::Retry)
                .await
            {
                Ok(_) => report.redispatched += 1,
                Err(ExecutionError::Claim(e)) if e.is_conflict() => {}
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to redispatch stalled retry");
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                republished = report.republished,
                redispatched = report.redispatched,
                "retry sweep repaired jobs"
            );
        }
        Ok(report)
    }

    pub async fn sweep(&self) -> Result<SweepReport, PipelineError> {
        self.sweep_at(Utc::now()).await
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}
