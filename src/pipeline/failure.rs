//! Routes failure events to a retry or to the dead letter sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{Consumer, PipelineError};
use crate::core::retry::BackoffPolicy;
use crate::queue::{
    DeadLetterEvent, FailureEvent, Message, MessageQueue, RetryEvent, publish_event,
};
use crate::storage::JobStore;

/// Dead-letter reason for jobs that used their whole retry budget.
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Consumer of the failure-events topic.
pub struct FailureHandler {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn MessageQueue>,
    backoff: BackoffPolicy,
}

impl FailureHandler {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            store,
            queue,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Route one failure event.
    pub async fn route(
        &self,
        event: &FailureEvent,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if event.retry_count < event.max_retries {
            let retry = RetryEvent {
                job_id: event.job_id,
                retry_count: event.retry_count,
                computed_delay_ms: self.backoff.delay_ms_for(event.retry_count),
                timestamp: now,
            };
            tracing::info!(
                job_id = %event.job_id,
                retry_count = event.retry_count,
                delay_ms = retry.computed_delay_ms,
                "scheduling retry"
            );
            publish_event(self.queue.as_ref(), &retry).await?;
        } else {
            let job = self.store.get_job(&event.job_id).await?;
            let dead = DeadLetterEvent::from_job(&job, MAX_RETRIES_EXCEEDED, now);
            tracing::warn!(
                job_id = %event.job_id,
                retry_count = event.retry_count,
                max_retries = event.max_retries,
                "retries exhausted, dead-lettering job"
            );
            publish_event(self.queue.as_ref(), &dead).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for FailureHandler {
    async fn handle(&self, message: &Message) -> Result<(), PipelineError> {
        let event: FailureEvent = message.decode()?;
        self.route(&event, Utc::now()).await
    }
}
