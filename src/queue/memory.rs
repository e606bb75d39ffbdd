//! In-process queue built on bounded tokio channels.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};

use super::{Message, MessageQueue, QueueError, Subscription, Topic};

/// Default per-topic channel capacity.
pub const DEFAULT_TOPIC_BUFFER: usize = 1024;

enum TopicState {
    /// No consumer yet; messages are held until one subscribes.
    Pending(Vec<Message>),
    Subscribed(mpsc::Sender<Message>),
}

/// In-memory [`MessageQueue`].
///
/// Each topic accepts a single subscriber. Messages published before the
/// subscriber attaches are delivered to it in publish order.
pub struct InMemoryQueue {
    topics: Mutex<HashMap<Topic, TopicState>>,
    buffer: usize,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_TOPIC_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Number of messages waiting for a subscriber on `topic`.
    pub async fn pending(&self, topic: Topic) -> usize {
        match self.topics.lock().await.get(&topic) {
            Some(TopicState::Pending(messages)) => messages.len(),
            _ => 0,
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, message: Message) -> Result<(), QueueError> {
        let topic = message.topic;
        let sender = {
            let mut topics = self.topics.lock().await;
            match topics
                .entry(topic)
                .or_insert_with(|| TopicState::Pending(Vec::new()))
            {
                TopicState::Pending(messages) => {
                    messages.push(message);
                    return Ok(());
                }
                TopicState::Subscribed(tx) => tx.clone(),
            }
        };

        sender
            .send(message)
            .await
            .map_err(|_| QueueError::Closed(topic))
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription, QueueError> {
        let mut topics = self.topics.lock().await;
        let backlog = match topics.remove(&topic) {
            Some(TopicState::Subscribed(tx)) if !tx.is_closed() => {
                topics.insert(topic, TopicState::Subscribed(tx));
                return Err(QueueError::AlreadySubscribed(topic));
            }
            Some(TopicState::Pending(messages)) => messages,
            _ => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(self.buffer.max(backlog.len()));
        for message in backlog {
            tx.try_send(message).map_err(|_| QueueError::Closed(topic))?;
        }
        topics.insert(topic, TopicState::Subscribed(tx));

        Ok(Subscription::new(topic, rx))
    }
}
