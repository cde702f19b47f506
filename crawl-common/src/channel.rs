//! Topic channel contract shared by both pipelines.
//!
//! A topic carries entity keys as plain UTF-8 payloads. Delivery is at-least-once and unordered,
//! consumers are expected to be idempotent through the dedup store.
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;
use tracing::warn;

use crate::kafka::Offset;

/// Header carrying how many times a key was already re-published after a failure.
pub const ATTEMPT_HEADER: &str = "crawl_attempt";
/// Header carrying the player key whose match history produced a match key.
pub const ORIGIN_HEADER: &str = "crawl_origin";

/// A key travelling on a topic, with the bookkeeping we attach as message headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMessage {
    pub key: String,
    pub attempt: u32,
    pub origin: Option<String>,
}

impl KeyMessage {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            attempt: 0,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// The same key, to be published again for another attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            key: self.key.clone(),
            attempt: self.attempt + 1,
            origin: self.origin.clone(),
        }
    }
}

/// A message received from a topic. Must be acknowledged once handled so the consumer can move
/// past it; unacknowledged messages are redelivered after a restart.
#[derive(Debug)]
pub struct Delivery {
    pub message: KeyMessage,
    offset: Option<Offset>,
}

impl Delivery {
    pub fn new(message: KeyMessage) -> Self {
        Self {
            message,
            offset: None,
        }
    }

    pub(crate) fn with_offset(message: KeyMessage, offset: Offset) -> Self {
        Self {
            message,
            offset: Some(offset),
        }
    }

    pub fn key(&self) -> &str {
        &self.message.key
    }

    pub fn ack(self) {
        if let Some(offset) = self.offset {
            if let Err(error) = offset.store() {
                warn!(key = self.message.key, "failed to store offset: {}", error);
            }
        }
    }
}

/// Outcome of a single bounded wait on a topic.
#[derive(Debug)]
pub enum Polled {
    Message(Delivery),
    Empty,
    /// Something went wrong, but the client is expected to recover on its own.
    Transient(ChannelError),
    /// The owning polling loop must stop.
    Fatal(ChannelError),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("all brokers are down")]
    AllBrokersDown,
    #[error("received an invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to produce to {topic}: {error}")]
    Kafka { topic: String, error: KafkaError },
    #[error("failed to produce to {topic} (canceled)")]
    Canceled { topic: String },
    #[error("{topic} rejected key {key}")]
    Rejected { topic: String, key: String },
}

/// Producing side of a topic. `publish` returns once the bus acknowledged (or refused) that one
/// message.
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    fn topic(&self) -> &str;

    async fn publish(&self, message: &KeyMessage) -> Result<(), PublishError>;

    async fn send_message(&self, key: &str) -> Result<(), PublishError> {
        self.publish(&KeyMessage::new(key)).await
    }
}

/// Consuming side of a topic.
#[async_trait]
pub trait TopicSubscriber: Send + Sync {
    fn topic(&self) -> &str;

    /// Wait at most `timeout` for the next message.
    async fn poll(&self, timeout: Duration) -> Polled;

    async fn close(&self);
}
