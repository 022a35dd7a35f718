//! In-memory publish/subscribe for standalone mode and tests.
//!
//! Implements the same [`PubSub`] surface as the AMQP broker within a
//! single process: one queue per topic, competing consumers, nack
//! redelivery with the same attempt accounting. Delayed delivery uses a
//! timer, which is acceptable in-process — durability across restarts is an
//! AMQP-only concern.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{Disposition, Message, PubSub, PubSubError, PublishOpts, Result, SubscribeOpts};
use crate::lifecycle::Lifecycle;

/// Queue depth per topic.
const TOPIC_QUEUE_CAPACITY: usize = 1024;

/// In-memory [`PubSub`].
pub struct MemoryPubSub {
    inner: Arc<Inner>,
}

struct Inner {
    lifecycle: Lifecycle,
    max_redelivery_attempts: u32,
    topics: Mutex<HashMap<String, TopicState>>,
    closed_tx: watch::Sender<bool>,
}

struct TopicState {
    queue_tx: mpsc::Sender<(Message, u32)>,
    subscribers: Arc<RwLock<Vec<mpsc::Sender<Message>>>>,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPubSub {
    /// Create a started in-memory pub/sub with the default redelivery
    /// budget.
    pub fn new() -> Self {
        Self::with_max_redelivery_attempts(10)
    }

    /// Create a started in-memory pub/sub with an explicit redelivery
    /// budget.
    pub fn with_max_redelivery_attempts(max_redelivery_attempts: u32) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let lifecycle = Lifecycle::new("mem-pubsub");
        lifecycle.start();

        info!("in-memory pub/sub started");

        Self {
            inner: Arc::new(Inner {
                lifecycle,
                max_redelivery_attempts,
                topics: Mutex::new(HashMap::new()),
                closed_tx,
            }),
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()> {
        self.inner.lifecycle.ensure_started()?;

        for msg in messages {
            self.inner.enqueue(topic, msg, 0).await?;
        }

        Ok(())
    }

    async fn publish_with_opts(&self, topic: &str, msg: Message, opts: PublishOpts) -> Result<()> {
        self.inner.lifecycle.ensure_started()?;

        match opts.delivery_delay {
            Some(delay) if !delay.is_zero() => {
                let inner = Arc::clone(&self.inner);
                let topic = topic.to_string();
                let mut closed = self.inner.closed_tx.subscribe();

                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            if let Err(e) = inner.enqueue(&topic, msg, 0).await {
                                warn!(topic = %topic, error = %e, "delayed publish dropped");
                            }
                        }
                        _ = closed.changed() => {}
                    }
                });

                Ok(())
            }
            _ => self.inner.enqueue(topic, msg, 0).await,
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
        let (tx, rx) = mpsc::channel(pool);

        let state = self.inner.topic_state(topic).await;
        state.subscribers.write().await.push(tx);

        debug!(topic = %topic, "subscribed");

        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.inner.lifecycle.ensure_started().is_ok()
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.lifecycle.begin_stop() {
            return Ok(());
        }

        let _ = self.inner.closed_tx.send(true);
        self.inner.topics.lock().await.clear();
        self.inner.lifecycle.finish_stop();

        info!("in-memory pub/sub stopped");

        Ok(())
    }
}

impl Inner {
    async fn enqueue(&self, topic: &str, msg: Message, attempt: u32) -> Result<()> {
        let state = self.topic_state(topic).await;

        state
            .queue_tx
            .send((msg, attempt))
            .await
            .map_err(|_| PubSubError::Publish(format!("topic {topic} queue closed")))
    }

    /// Get or create the queue and dispatcher for a topic.
    async fn topic_state(&self, topic: &str) -> TopicState {
        let mut topics = self.topics.lock().await;

        if let Some(state) = topics.get(topic) {
            return TopicState {
                queue_tx: state.queue_tx.clone(),
                subscribers: Arc::clone(&state.subscribers),
            };
        }

        let (queue_tx, queue_rx) = mpsc::channel(TOPIC_QUEUE_CAPACITY);
        let subscribers = Arc::new(RwLock::new(Vec::new()));

        let state = TopicState {
            queue_tx: queue_tx.clone(),
            subscribers: Arc::clone(&subscribers),
        };

        topics.insert(
            topic.to_string(),
            TopicState {
                queue_tx,
                subscribers: Arc::clone(&subscribers),
            },
        );

        let topic = topic.to_string();
        let max_attempts = self.max_redelivery_attempts;
        let closed = self.closed_tx.subscribe();
        let requeue_tx = state.queue_tx.clone();

        tokio::spawn(dispatch_loop(
            topic,
            queue_rx,
            requeue_tx,
            subscribers,
            max_attempts,
            closed,
        ));

        state
    }
}

/// Per-topic dispatcher: hands each queued message to one subscriber
/// (competing consumers, round-robin) and re-enqueues nacked messages until
/// the attempt budget is exhausted.
async fn dispatch_loop(
    topic: String,
    mut queue_rx: mpsc::Receiver<(Message, u32)>,
    requeue_tx: mpsc::Sender<(Message, u32)>,
    subscribers: Arc<RwLock<Vec<mpsc::Sender<Message>>>>,
    max_attempts: u32,
    mut closed: watch::Receiver<bool>,
) {
    let mut next_subscriber = 0usize;

    loop {
        let (msg, attempt) = tokio::select! {
            _ = closed.changed() => break,
            queued = queue_rx.recv() => match queued {
                Some(entry) => entry,
                None => break,
            },
        };

        let Some(sub) = pick_subscriber(&subscribers, &mut next_subscriber).await else {
            // No live subscribers; drop the message like an unbound queue.
            debug!(topic = %topic, message_id = %msg.uuid, "no subscribers, dropping message");
            continue;
        };

        if sub.send(msg.clone()).await.is_err() {
            continue;
        }

        let disposition = tokio::select! {
            d = msg.await_disposition() => d,
            _ = closed.changed() => {
                msg.nack();
                break;
            }
        };

        if disposition == Disposition::Nack {
            let next = attempt + 1;
            if next > max_attempts {
                warn!(
                    topic = %topic,
                    message_id = %msg.uuid,
                    attempts = attempt,
                    "redelivery attempts exhausted, dropping message"
                );
                continue;
            }

            // Redeliver as a fresh message so the new delivery gets its own
            // acknowledgement cycle. try_send avoids the dispatcher blocking
            // on its own queue.
            let mut redelivery = Message::with_uuid(msg.uuid.clone(), msg.payload.clone());
            redelivery.metadata = msg.metadata.clone();

            if requeue_tx.try_send((redelivery, next)).is_err() {
                warn!(topic = %topic, message_id = %msg.uuid, "queue full, dropping nacked message");
            }
        }
    }

    debug!(topic = %topic, "dispatcher stopped");
}

async fn pick_subscriber(
    subscribers: &Arc<RwLock<Vec<mpsc::Sender<Message>>>>,
    next: &mut usize,
) -> Option<mpsc::Sender<Message>> {
    let mut subs = subscribers.write().await;
    subs.retain(|s| !s.is_closed());

    if subs.is_empty() {
        return None;
    }

    let idx = *next % subs.len();
    *next = next.wrapping_add(1);
    Some(subs[idx].clone())
}
