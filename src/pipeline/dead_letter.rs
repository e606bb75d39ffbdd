//! Dead letter sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{Consumer, PipelineError};
use crate::core::job::{Job, JobStatus};
use crate::core::log::ExecutionLog;
use crate::core::state::Transition;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::queue::{DeadLetterEvent, Message};
use crate::storage::{DeadLetterRecord, JobStore};

/// Consumer of the dead-letter topic.
///
/// Persists a [`DeadLetterRecord`], then marks the job exhausted and
/// notifies. The job stays Failed. A record left behind by an earlier
/// delivery that failed half way is reused, so redelivery never writes a
/// second record for the same failure.
pub struct DeadLetterHandler {
    store: Arc<dyn JobStore>,
    notifier: Arc<Notifier>,
}

impl DeadLetterHandler {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Returns `false` when the job was already dead-lettered or has moved on.
    pub async fn process(
        &self,
        event: &DeadLetterEvent,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let job = self.store.get_job(&event.job_id).await?;
        if job.exhausted {
            tracing::debug!(job_id = %job.id, "job already dead-lettered");
            return Ok(false);
        }
        if job.status != JobStatus::Failed {
            tracing::warn!(job_id = %job.id, status = %job.status, "dead letter for job that is no longer failed");
            return Ok(false);
        }

        if !self.already_recorded(&job, event).await? {
            self.store
                .record_dead_letter(DeadLetterRecord {
                    job_id: event.job_id,
                    job_name: event.job_name.clone(),
                    reason: event.reason.clone(),
                    final_retry_count: event.final_retry_count,
                    max_retries: event.max_retries,
                    payload: event.payload.clone(),
                    error_message: event.error_message.clone(),
                    recorded_at: now,
                })
                .await?;
        }

        let job = match self
            .store
            .transition(&event.job_id, &Transition::MarkExhausted, now)
            .await
        {
            Ok(job) => job,
            Err(e) if e.is_conflict() => {
                tracing::warn!(job_id = %event.job_id, reason = %e, "job changed before it could be marked exhausted");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let log = ExecutionLog::error(job.id, "Job moved to dead letter queue")
            .with_details(event.reason.clone())
            .at(now);
        if let Err(e) = self.store.append_log(log).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to append execution log");
        }

        tracing::error!(
            job_id = %job.id,
            job_name = %job.name,
            final_retry_count = event.final_retry_count,
            reason = %event.reason,
            "job dead-lettered"
        );
        self.notifier
            .send(
                Notification::new(NotificationKind::DeadLettered, job)
                    .with_details(event.reason.clone()),
            )
            .await;
        Ok(true)
    }

    /// A record for this failure exists when one was written for the same
    /// retry count since the job's last dispatch.
    async fn already_recorded(
        &self,
        job: &Job,
        event: &DeadLetterEvent,
    ) -> Result<bool, PipelineError> {
        let records = self.store.dead_letters_for(&job.id).await?;
        Ok(records.iter().any(|record| {
            record.final_retry_count == event.final_retry_count
                && job.started_at.is_none_or(|started| record.recorded_at >= started)
        }))
    }
}

#[async_trait]
impl Consumer for DeadLetterHandler {
    async fn handle(&self, message: &Message) -> Result<(), PipelineError> {
        let event: DeadLetterEvent = message.decode()?;
        self.process(&event, Utc::now()).await.map(|_| ())
    }
}
