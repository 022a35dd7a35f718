//! AMQP (RabbitMQ) publish/subscribe implementation.
//!
//! Each topic maps to a durable fanout exchange plus a durable queue of the
//! same name. Two auxiliary queues per topic implement deferred dispatch
//! without in-process timers, using per-message TTL and dead-letter routing
//! back to the primary exchange:
//!
//! - `{topic}.wait` — delayed delivery ([`PublishOpts::delivery_delay`])
//! - `{topic}.redelivery` — backoff between nack and the next attempt
//!
//! The current attempt is carried in the `delivery-attempt` header; once it
//! exceeds the configured budget the message is dropped with a warning.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Message, PubSub, PubSubError, PublishOpts, Result, SubscribeOpts};
use crate::lifecycle::Lifecycle;

mod connection;
use connection::ConnectionManager;
pub(crate) use connection::extract_endpoint;

/// Header carrying the redelivery attempt count.
const DELIVERY_ATTEMPT_HEADER: &str = "delivery-attempt";

const DEFAULT_MAX_CONNECT_RETRIES: u32 = 25;
const DEFAULT_MAX_CONNECTION_CHANNELS: u32 = 1000;
const DEFAULT_MAX_REDELIVERY_ATTEMPTS: u32 = 10;
const DEFAULT_REDELIVERY_MULTIPLIER: f64 = 1.5;
const DEFAULT_REDELIVERY_INITIAL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_REDELIVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the AMQP broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AMQP dial URL (e.g., amqp://localhost:5672).
    pub uri: String,
    /// Dial retries before startup fails.
    pub max_connect_retries: u32,
    /// Channels issued per connection before a new connection is dialed.
    pub max_connection_channels: u32,
    /// Redeliveries after the first delivery of a nacked message.
    pub max_redelivery_attempts: u32,
    /// Backoff multiplier between redelivery attempts.
    pub redelivery_multiplier: f64,
    /// Backoff base interval.
    #[serde(with = "humantime_serde")]
    pub redelivery_initial_interval: Duration,
    /// Backoff ceiling.
    #[serde(with = "humantime_serde")]
    pub max_redelivery_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: "amqp://localhost:5672".to_string(),
            max_connect_retries: DEFAULT_MAX_CONNECT_RETRIES,
            max_connection_channels: DEFAULT_MAX_CONNECTION_CHANNELS,
            max_redelivery_attempts: DEFAULT_MAX_REDELIVERY_ATTEMPTS,
            redelivery_multiplier: DEFAULT_REDELIVERY_MULTIPLIER,
            redelivery_initial_interval: DEFAULT_REDELIVERY_INITIAL_INTERVAL,
            max_redelivery_interval: DEFAULT_MAX_REDELIVERY_INTERVAL,
        }
    }
}

impl Config {
    /// Config with defaults for the given dial URL.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }
}

/// AMQP-backed [`PubSub`].
pub struct AmqpPubSub {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    lifecycle: Lifecycle,
    conn_mgr: ConnectionManager,
    /// Channel reserved for publishing; replaced transparently when the
    /// underlying connection is lost.
    publisher: Mutex<Option<Channel>>,
    /// Topics whose exchange/queue topology has been declared.
    declared: Mutex<HashSet<String>>,
    closed_tx: watch::Sender<bool>,
}

impl AmqpPubSub {
    /// Connect to the broker and return a started pub/sub.
    ///
    /// Fails with [`PubSubError::ConnectRetriesExhausted`] once the dial
    /// retry budget is spent; callers treat that as fatal at startup.
    pub async fn new(config: Config) -> Result<Self> {
        let conn_mgr = ConnectionManager::new(
            config.uri.clone(),
            config.max_connect_retries as usize,
            config.max_connection_channels,
        );

        // Establish the publisher connection up front so startup fails fast
        // when the broker is unreachable.
        conn_mgr.get_connection(true).await?;

        let (closed_tx, _) = watch::channel(false);

        let lifecycle = Lifecycle::new(format!("amqp-{}", extract_endpoint(&config.uri)));
        lifecycle.start();

        info!(endpoint = %extract_endpoint(&config.uri), "AMQP pub/sub started");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                lifecycle,
                conn_mgr,
                publisher: Mutex::new(None),
                declared: Mutex::new(HashSet::new()),
                closed_tx,
            }),
        })
    }
}

#[async_trait]
impl PubSub for AmqpPubSub {
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()> {
        self.inner.lifecycle.ensure_started()?;

        for msg in &messages {
            self.inner.publish_primary(topic, msg, 0).await?;
        }

        Ok(())
    }

    async fn publish_with_opts(&self, topic: &str, msg: Message, opts: PublishOpts) -> Result<()> {
        self.inner.lifecycle.ensure_started()?;

        match opts.delivery_delay {
            Some(delay) if !delay.is_zero() => {
                self.inner
                    .publish_queued(topic, &wait_queue(topic), &msg, 0, delay)
                    .await
            }
            _ => self.inner.publish_primary(topic, &msg, 0).await,
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Message>> {
        self.subscribe_with_opts(topic, SubscribeOpts::default())
            .await
    }

    async fn subscribe_with_opts(
        &self,
        topic: &str,
        opts: SubscribeOpts,
    ) -> Result<mpsc::Receiver<Message>> {
        self.inner.lifecycle.ensure_started()?;

        let pool = opts.pool.max(1);
        let (out_tx, out_rx) = mpsc::channel(pool);

        for i in 0..pool {
            let conn = self.inner.conn_mgr.get_connection(false).await?;
            let channel = conn.create_channel().await?;

            self.inner.ensure_topology(&channel, topic).await?;

            channel
                .basic_qos(1, BasicQosOptions::default())
                .await
                .map_err(|e| PubSubError::Subscribe(format!("set prefetch: {e}")))?;

            let consumer = channel
                .basic_consume(
                    topic,
                    &format!("{}-{}-{}", topic, i, Uuid::new_v4()),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| PubSubError::Subscribe(format!("start consumer: {e}")))?;

            let inner = Arc::clone(&self.inner);
            let topic = topic.to_string();
            let out = out_tx.clone();
            let closed = self.inner.closed_tx.subscribe();

            tokio::spawn(async move {
                inner.consume_loop(&topic, consumer, out, closed).await;
            });
        }

        debug!(topic = %topic, pool = pool, "subscribed");

        Ok(out_rx)
    }

    fn is_connected(&self) -> bool {
        self.inner.conn_mgr.is_connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.lifecycle.begin_stop() {
            return Ok(());
        }

        info!(service = %self.inner.lifecycle.name(), "stopping AMQP pub/sub");

        let _ = self.inner.closed_tx.send(true);
        *self.inner.publisher.lock().await = None;

        let result = self.inner.conn_mgr.close().await;

        self.inner.lifecycle.finish_stop();

        result
    }
}

impl Inner {
    /// Publish to the primary exchange of a topic.
    async fn publish_primary(&self, topic: &str, msg: &Message, attempt: u32) -> Result<()> {
        self.publish_raw(topic, topic, "", msg, attempt, None).await
    }

    /// Publish directly to a wait/redelivery queue with a per-message TTL.
    /// The queue dead-letters into the primary exchange when the TTL fires.
    /// Routing goes through the default exchange, which routes by queue
    /// name.
    async fn publish_queued(
        &self,
        topic: &str,
        queue: &str,
        msg: &Message,
        attempt: u32,
        ttl: Duration,
    ) -> Result<()> {
        self.publish_raw(topic, "", queue, msg, attempt, Some(ttl))
            .await
    }

    async fn publish_raw(
        &self,
        topic: &str,
        exchange: &str,
        routing_key: &str,
        msg: &Message,
        attempt: u32,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let channel = self.publisher_channel().await?;

        self.ensure_topology(&channel, topic).await?;

        let mut properties = BasicProperties::default()
            .with_message_id(msg.uuid.as_str().into())
            .with_delivery_mode(2) // persistent
            .with_headers(build_headers(msg, attempt));

        if let Some(ttl) = ttl {
            properties = properties.with_expiration(ttl.as_millis().to_string().into());
        }

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &msg.payload,
                properties,
            )
            .await
            .map_err(|e| PubSubError::Publish(format!("publish: {e}")))?;

        confirm
            .await
            .map_err(|e| PubSubError::Publish(format!("publish confirmation: {e}")))?;

        debug!(
            message_id = %msg.uuid,
            exchange = %exchange,
            routing_key = %routing_key,
            "published message"
        );

        Ok(())
    }

    /// Get the shared publisher channel, creating a fresh one when the
    /// previous channel's connection was lost.
    async fn publisher_channel(&self) -> Result<Channel> {
        let mut guard = self.publisher.lock().await;

        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let conn = self.conn_mgr.get_connection(true).await?;
        let channel = conn.create_channel().await?;
        *guard = Some(channel.clone());

        Ok(channel)
    }

    /// Declare the exchange, primary queue, and auxiliary queues for a
    /// topic. Declarations are cached per topic.
    async fn ensure_topology(&self, channel: &Channel, topic: &str) -> Result<()> {
        let mut declared = self.declared.lock().await;
        if declared.contains(topic) {
            return Ok(());
        }

        channel
            .exchange_declare(
                topic,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PubSubError::Connection(format!("declare exchange {topic}: {e}")))?;

        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .queue_declare(topic, durable, FieldTable::default())
            .await
            .map_err(|e| PubSubError::Connection(format!("declare queue {topic}: {e}")))?;

        channel
            .queue_bind(
                topic,
                topic,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| PubSubError::Connection(format!("bind queue {topic}: {e}")))?;

        // Expired messages in the auxiliary queues dead-letter back into
        // the primary exchange.
        let mut dead_letter_args = FieldTable::default();
        dead_letter_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(topic.into()),
        );

        for queue in [wait_queue(topic), redelivery_queue(topic)] {
            channel
                .queue_declare(&queue, durable, dead_letter_args.clone())
                .await
                .map_err(|e| PubSubError::Connection(format!("declare queue {queue}: {e}")))?;
        }

        declared.insert(topic.to_string());

        debug!(topic = %topic, "declared topic topology");

        Ok(())
    }

    /// Read deliveries from one consumer and fan them into the output
    /// channel, acknowledging each according to its disposition.
    async fn consume_loop(
        &self,
        topic: &str,
        mut consumer: lapin::Consumer,
        out: mpsc::Sender<Message>,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            if *closed.borrow() {
                break;
            }

            let delivery = tokio::select! {
                _ = closed.changed() => break,
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(topic = %topic, error = %e, "consumer delivery error");
                        break;
                    }
                    None => break,
                },
            };

            let (msg, attempt) = message_from_delivery(&delivery);

            if out.send(msg.clone()).await.is_err() {
                // Subscriber dropped its channel; release the delivery.
                let _ = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await;
                break;
            }

            tokio::select! {
                disposition = msg.await_disposition() => match disposition {
                    super::Disposition::Ack => {
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            error!(message_id = %msg.uuid, error = %e, "failed to ack message");
                        }
                    }
                    super::Disposition::Nack => {
                        self.redeliver(topic, &msg, attempt, delivery).await;
                    }
                },
                _ = closed.changed() => {
                    // Service stopping; release the unacknowledged delivery.
                    let _ = delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await;
                    break;
                }
            }
        }

        debug!(topic = %topic, "consumer stopped");
    }

    /// Route a nacked message through the redelivery queue, or drop it once
    /// the attempt budget is exhausted.
    async fn redeliver(
        &self,
        topic: &str,
        msg: &Message,
        attempt: u32,
        delivery: lapin::message::Delivery,
    ) {
        let next = attempt + 1;

        if next > self.config.max_redelivery_attempts {
            warn!(
                message_id = %msg.uuid,
                topic = %topic,
                attempts = attempt,
                "redelivery attempts exhausted, dropping message"
            );

            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(message_id = %msg.uuid, error = %e, "failed to ack dropped message");
            }

            return;
        }

        let interval = self.redelivery_interval(next);

        match self
            .publish_queued(topic, &redelivery_queue(topic), msg, next, interval)
            .await
        {
            Ok(()) => {
                debug!(
                    message_id = %msg.uuid,
                    topic = %topic,
                    attempt = next,
                    interval_ms = %interval.as_millis(),
                    "scheduled redelivery"
                );

                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(message_id = %msg.uuid, error = %e, "failed to ack redelivered message");
                }
            }
            Err(e) => {
                error!(
                    message_id = %msg.uuid,
                    topic = %topic,
                    error = %e,
                    "failed to schedule redelivery, requeueing"
                );

                let _ = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await;
            }
        }
    }

    /// Backoff before redelivery attempt `k`:
    /// `min(initial * multiplier^(k-1), max)`, with `interval(0) = 0`.
    fn redelivery_interval(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let initial = self.config.redelivery_initial_interval.as_millis() as f64;
        let interval = initial * self.config.redelivery_multiplier.powi(attempt as i32 - 1);
        let capped = interval.min(self.config.max_redelivery_interval.as_millis() as f64);

        Duration::from_millis(capped as u64)
    }
}

fn wait_queue(topic: &str) -> String {
    format!("{topic}.wait")
}

fn redelivery_queue(topic: &str) -> String {
    format!("{topic}.redelivery")
}

/// Copy message metadata and the attempt count into AMQP headers.
fn build_headers(msg: &Message, attempt: u32) -> FieldTable {
    let mut headers = FieldTable::default();

    for (key, value) in &msg.metadata {
        headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
    }

    headers.insert(
        DELIVERY_ATTEMPT_HEADER.into(),
        AMQPValue::LongLongInt(attempt as i64),
    );

    headers
}

/// Rebuild a [`Message`] and its attempt count from a delivery.
fn message_from_delivery(delivery: &lapin::message::Delivery) -> (Message, u32) {
    let uuid = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut msg = Message::with_uuid(uuid, delivery.data.clone());
    let mut attempt = 0;

    if let Some(headers) = delivery.properties.headers() {
        for (key, value) in headers.inner() {
            if key.as_str() == DELIVERY_ATTEMPT_HEADER {
                attempt = header_int(value).unwrap_or(0);
                continue;
            }

            if let AMQPValue::LongString(s) = value {
                if let Ok(text) = std::str::from_utf8(s.as_bytes()) {
                    msg.metadata.insert(key.as_str().to_string(), text.to_string());
                }
            }
        }
    }

    (msg, attempt)
}

fn header_int(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongLongInt(i) => u32::try_from(*i).ok(),
        AMQPValue::LongInt(i) => u32::try_from(*i).ok(),
        AMQPValue::ShortInt(i) => u32::try_from(*i).ok(),
        AMQPValue::ShortShortInt(i) => u32::try_from(*i).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
