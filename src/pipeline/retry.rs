//! Retry consumer.
//!
//! Consumes retry events, moves the job into Retrying, and arms a timer that
//! resubmits it to the retry lane once the backoff delay has elapsed. The
//! consumer never sleeps itself, so a long delay on one job does not hold up
//! retry events for others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::{Consumer, PipelineError};
use crate::core::log::ExecutionLog;
use crate::core::state::Transition;
use crate::core::types::JobId;
use crate::execution::{ExecutionError, ExecutorPool, Lane};
use crate::queue::{Message, RetryEvent};
use crate::storage::JobStore;

/// Consumer of the retry-pipeline topic.
pub struct RetryConsumer {
    store: Arc<dyn JobStore>,
    pool: ExecutorPool,
    timers: Mutex<JoinSet<()>>,
}

impl RetryConsumer {
    pub fn new(store: Arc<dyn JobStore>, pool: ExecutorPool) -> Self {
        Self {
            store,
            pool,
            timers: Mutex::new(JoinSet::new()),
        }
    }

    /// Begin the retry described by `event`.
    ///
    /// Returns `false` when the event was a duplicate and got discarded.
    pub async fn begin(&self, event: &RetryEvent, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let transition = Transition::BeginRetry {
            expected_retry_count: event.retry_count,
        };
        let job = match self.store.transition(&event.job_id, &transition, now).await {
            Ok(job) => job,
            Err(e) if e.is_conflict() => {
                tracing::debug!(
                    job_id = %event.job_id,
                    retry_count = event.retry_count,
                    reason = %e,
                    "discarding duplicate retry event"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let log = ExecutionLog::warn(
            job.id,
            format!("Retrying job execution (attempt {})", job.current_retry_count),
        )
        .with_details(format!("delay {} ms", event.computed_delay_ms))
        .at(now);
        if let Err(e) = self.store.append_log(log).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to append execution log");
        }
        tracing::info!(
            job_id = %job.id,
            attempt = job.current_retry_count,
            max_retries = job.max_retries,
            delay_ms = event.computed_delay_ms,
            "retry scheduled"
        );

        self.arm(job.id, Duration::from_millis(event.computed_delay_ms))
            .await;
        Ok(true)
    }

    /// Resubmit `job_id` to the retry lane after `delay`.
    pub async fn arm(&self, job_id: JobId, delay: Duration) {
        let pool = self.pool.clone();
        let mut timers = self.timers.lock().await;
        while timers.try_join_next().is_some() {}
        timers.spawn(async move {
            tokio::time::sleep(delay).await;
            match pool
                .claim_and_submit(job_id, Transition::Redispatch, Lane::Retry)
                .await
            {
                Ok(_) => {}
                Err(ExecutionError::Claim(e)) if e.is_conflict() => {
                    tracing::debug!(job_id = %job_id, reason = %e, "retry no longer applicable");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to resubmit retry");
                }
            }
        });
    }

    /// Number of armed timers that have not fired yet.
    pub async fn pending_timers(&self) -> usize {
        let mut timers = self.timers.lock().await;
        while timers.try_join_next().is_some() {}
        timers.len()
    }

    /// Drop every armed timer.
    pub async fn cancel_timers(&self) {
        self.timers.lock().await.abort_all();
    }
}

#[async_trait]
impl Consumer for RetryConsumer {
    async fn handle(&self, message: &Message) -> Result<(), PipelineError> {
        let event: RetryEvent = message.decode()?;
        self.begin(&event, Utc::now()).await.map(|_| ())
    }
}
