//! Message queue abstraction.
//!
//! The failure pipeline is wired through three topics. Producers publish
//! JSON-encoded events keyed by job id; each topic has one consumer.

mod events;
mod memory;

pub use events::{DeadLetterEvent, FailureEvent, QueueEvent, RetryEvent, publish_event};
pub use memory::InMemoryQueue;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Queue topics used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    FailureEvents,
    RetryPipeline,
    DeadLetter,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::FailureEvents, Topic::RetryPipeline, Topic::DeadLetter];

    /// Wire name of the topic.
    pub fn name(&self) -> &'static str {
        match self {
            Topic::FailureEvents => "failure-events",
            Topic::RetryPipeline => "retry-pipeline",
            Topic::DeadLetter => "dead-letter",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors from publishing to or consuming from a queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("topic '{0}' is closed")]
    Closed(Topic),

    #[error("topic '{0}' already has a subscriber")]
    AlreadySubscribed(Topic),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A keyed message on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: Topic,
    pub key: String,
    pub payload: String,
}

impl Message {
    /// Serialize `value` as the JSON payload of a new message.
    pub fn encode<T: Serialize>(
        topic: Topic,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            topic,
            key: key.into(),
            payload: serde_json::to_string(value)?,
        })
    }

    /// Deserialize the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Receiving side of a topic.
pub struct Subscription {
    topic: Topic,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(topic: Topic, rx: mpsc::Receiver<Message>) -> Self {
        Self { topic, rx }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next message. Returns `None` once the queue is dropped.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Topic-based message transport.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publish a message to its topic.
    async fn publish(&self, message: Message) -> Result<(), QueueError>;

    /// Attach the consumer of `topic`.
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, QueueError>;
}
