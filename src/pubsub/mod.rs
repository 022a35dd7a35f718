//! Publish/subscribe message broker.
//!
//! This module contains:
//! - [`PubSub`] trait: topic publish/subscribe with acknowledgement
//! - [`Message`]: payload + metadata with one-shot ack/nack
//! - Implementations: AMQP (RabbitMQ), in-memory

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod amqp;
mod message;
pub mod memory;

pub use amqp::AmqpPubSub;
pub use memory::MemoryPubSub;
pub use message::{Disposition, Message};

use crate::lifecycle::NotStartedError;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// Operation attempted outside the `Started` state.
    #[error(transparent)]
    NotStarted(#[from] NotStartedError),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Dial retries exhausted at startup; the process should abort.
    #[error("connect retries exhausted: {0}")]
    ConnectRetriesExhausted(String),
}

impl PubSubError {
    /// Whether this error is the "not started" sentinel.
    pub fn is_not_started(&self) -> bool {
        matches!(self, PubSubError::NotStarted(_))
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOpts {
    /// Lower bound on the delay before the message is dispatched to
    /// consumers. The message is never delivered before this elapses.
    pub delivery_delay: Option<Duration>,
}

impl PublishOpts {
    /// Options requesting delayed delivery.
    pub fn with_delivery_delay(delay: Duration) -> Self {
        Self {
            delivery_delay: Some(delay),
        }
    }
}

/// Per-subscribe options.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOpts {
    /// Number of parallel consumers reading the topic queue. Ordering is
    /// not preserved across consumers.
    pub pool: usize,
}

impl Default for SubscribeOpts {
    fn default() -> Self {
        Self { pool: 1 }
    }
}

impl SubscribeOpts {
    /// Options requesting a consumer pool of the given size.
    pub fn with_pool(pool: usize) -> Self {
        Self { pool: pool.max(1) }
    }
}

/// Interface for topic-based publish/subscribe with acknowledgement.
///
/// Each topic is backed by one logical queue; multiple subscribers compete
/// for its messages. Consumers must emit exactly one of ack/nack per
/// message; a nack triggers redelivery with backoff until the attempt
/// budget is exhausted.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish messages to a topic. Fire-and-forget: delivery failures on
    /// the consumer side are handled by redelivery, not by the publisher.
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()>;

    /// Publish a single message with options (delayed delivery).
    async fn publish_with_opts(&self, topic: &str, msg: Message, opts: PublishOpts) -> Result<()>;

    /// Subscribe to a topic with a single consumer.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Message>>;

    /// Subscribe to a topic with a pool of parallel consumers fanned into
    /// one bounded channel (capacity = pool size).
    async fn subscribe_with_opts(
        &self,
        topic: &str,
        opts: SubscribeOpts,
    ) -> Result<mpsc::Receiver<Message>>;

    /// Whether the underlying transport is connected.
    fn is_connected(&self) -> bool;

    /// Stop the broker. Pending deliveries are released back to the
    /// transport and subscriber channels close. Publish and subscribe fail
    /// with the not-started sentinel afterwards.
    async fn close(&self) -> Result<()>;
}
