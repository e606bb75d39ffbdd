//! Event payloads carried on the pipeline topics.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Message, MessageQueue, QueueError, Topic};
use crate::core::job::Job;
use crate::core::types::JobId;

/// An event bound to a fixed topic, keyed by its job.
pub trait QueueEvent: Serialize + DeserializeOwned + Send + Sync {
    const TOPIC: Topic;

    fn job_id(&self) -> JobId;
}

/// Encode `event` and publish it on its topic.
pub async fn publish_event<E: QueueEvent>(
    queue: &dyn MessageQueue,
    event: &E,
) -> Result<(), QueueError> {
    let message = Message::encode(E::TOPIC, event.job_id().to_string(), event)?;
    queue.publish(message).await
}

/// Published when an execution fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEvent {
    pub job_id: JobId,
    pub job_name: String,
    pub reason: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub can_retry: bool,
    pub timestamp: DateTime<Utc>,
}

impl FailureEvent {
    /// Describe the failure of `job` as currently stored.
    pub fn from_job(job: &Job, reason: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            reason: reason.into(),
            retry_count: job.current_retry_count,
            max_retries: job.max_retries,
            can_retry: job.can_retry(),
            timestamp,
        }
    }
}

impl QueueEvent for FailureEvent {
    const TOPIC: Topic = Topic::FailureEvents;

    fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// Requests a delayed re-execution.
///
/// `retry_count` is the job's count before the retry begins; consumers use
/// it to discard duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEvent {
    pub job_id: JobId,
    pub retry_count: u32,
    pub computed_delay_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl QueueEvent for RetryEvent {
    const TOPIC: Topic = Topic::RetryPipeline;

    fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// Terminal record of a job that ran out of retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEvent {
    pub job_id: JobId,
    pub job_name: String,
    pub reason: String,
    pub final_retry_count: u32,
    pub max_retries: u32,
    pub payload: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn from_job(job: &Job, reason: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            reason: reason.into(),
            final_retry_count: job.current_retry_count,
            max_retries: job.max_retries,
            payload: job.payload.clone(),
            error_message: job.error_message.clone(),
            timestamp,
        }
    }
}

impl QueueEvent for DeadLetterEvent {
    const TOPIC: Topic = Topic::DeadLetter;

    fn job_id(&self) -> JobId {
        self.job_id
    }
}
