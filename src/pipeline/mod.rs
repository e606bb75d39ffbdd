//! Failure pipeline.
//!
//! Failed executions flow through three topics:
//!
//! ```text
//! failure-events --FailureHandler--> retry-pipeline --RetryConsumer--> retry lane
//!                        \
//!                         +--------> dead-letter --DeadLetterHandler--> store + notify
//! ```
//!
//! Every consumer is idempotent: duplicates are detected through the job's
//! stored state and dropped.

mod dead_letter;
mod failure;
mod retry;
mod sweep;

pub use dead_letter::DeadLetterHandler;
pub use failure::{FailureHandler, MAX_RETRIES_EXCEEDED};
pub use retry::RetryConsumer;
pub use sweep::{RetrySweep, SweepReport};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::queue::{Message, QueueError, Subscription};
use crate::storage::StorageError;

/// Errors raised while handling a pipeline message.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A topic consumer.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), PipelineError>;
}

/// Drive `consumer` from `subscription` until the queue goes away.
///
/// Handler errors are logged; they never stop the loop.
pub fn spawn_consumer<C>(consumer: Arc<C>, mut subscription: Subscription) -> JoinHandle<()>
where
    C: Consumer + ?Sized + 'static,
{
    tokio::spawn(async move {
        let topic = subscription.topic();
        tracing::debug!(topic = %topic, "consumer started");
        while let Some(message) = subscription.recv().await {
            if let Err(e) = consumer.handle(&message).await {
                tracing::error!(topic = %topic, key = %message.key, error = %e, "failed to handle message");
            }
        }
        tracing::debug!(topic = %topic, "consumer stopped");
    })
}
