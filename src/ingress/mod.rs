//! HTTP ingress: converts authenticated POST requests into queued messages.
//!
//! Each accepted request becomes a [`Message`] delivered to the single
//! downstream subscriber; the HTTP response is held back until the consumer
//! acks (200), nacks (500), or the service stops (503). A bounded buffer
//! between the handler and the subscriber provides end-to-end flow control:
//! when it is full the caller gets 503 and is expected to retry.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

pub mod auth;

use crate::lifecycle::Lifecycle;
use crate::pubsub::{Disposition, Message};
use auth::{SignatureVerifier, TokenVerifier, Verification, ACTOR_IRI_KEY};

const DEFAULT_BUFFER_SIZE: usize = 100;

/// Largest request body accepted before responding 400.
const MAX_BODY_BYTES: usize = 1 << 22; // 4 MiB

/// Errors surfaced by the ingress subscriber itself.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error(transparent)]
    NotStarted(#[from] crate::lifecycle::NotStartedError),

    #[error("message buffer full")]
    BufferFull,

    #[error("already subscribed")]
    AlreadySubscribed,
}

/// Ingress configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the POST endpoint.
    pub service_endpoint: String,
    /// Capacity of the handler→subscriber buffer.
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_endpoint: "/inbox".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// HTTP subscriber: one POST endpoint feeding one message channel.
pub struct HttpSubscriber {
    inner: Arc<Inner>,
    msg_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    done_rx: std::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

struct Inner {
    endpoint: String,
    lifecycle: Lifecycle,
    pub_tx: mpsc::Sender<Message>,
    stop_tx: watch::Sender<bool>,
    verifier: Arc<dyn SignatureVerifier>,
    tokens: TokenVerifier,
}

impl HttpSubscriber {
    /// Create a started subscriber. The shovel task that feeds the
    /// subscriber channel runs until [`HttpSubscriber::close`].
    pub fn new(
        config: Config,
        verifier: Arc<dyn SignatureVerifier>,
        tokens: TokenVerifier,
    ) -> Self {
        let buffer = config.buffer_size.max(1);

        let (pub_tx, pub_rx) = mpsc::channel(buffer);
        let (msg_tx, msg_rx) = mpsc::channel(buffer);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let lifecycle = Lifecycle::new(format!("httpsubscriber-{}", config.service_endpoint));
        if lifecycle.start() {
            tokio::spawn(shovel(pub_rx, msg_tx, stop_rx, done_tx));
        }

        info!(endpoint = %config.service_endpoint, "HTTP subscriber started");

        Self {
            inner: Arc::new(Inner {
                endpoint: config.service_endpoint,
                lifecycle,
                pub_tx,
                stop_tx,
                verifier,
                tokens,
            }),
            msg_rx: std::sync::Mutex::new(Some(msg_rx)),
            done_rx: std::sync::Mutex::new(Some(done_rx)),
        }
    }

    /// Path of the POST endpoint.
    pub fn path(&self) -> &str {
        &self.inner.endpoint
    }

    /// The channel of accepted messages. Single consumer: the receiver can
    /// be taken once.
    pub fn subscribe(&self) -> Result<mpsc::Receiver<Message>, IngressError> {
        self.msg_rx
            .lock()
            .expect("receiver lock")
            .take()
            .ok_or(IngressError::AlreadySubscribed)
    }

    /// Router exposing the ingress endpoint; register with the node's HTTP
    /// server.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.endpoint, post(handle))
            .with_state(Arc::clone(&self.inner))
    }

    /// Stop the subscriber. The shovel drains first; only then does the
    /// subscriber channel close.
    pub async fn close(&self) {
        if !self.inner.lifecycle.begin_stop() {
            return;
        }

        info!(endpoint = %self.inner.endpoint, "stopping HTTP subscriber");

        let _ = self.inner.stop_tx.send(true);

        let done = self.done_rx.lock().expect("done lock").take();
        if let Some(done) = done {
            let _ = done.await;
        }

        self.inner.lifecycle.finish_stop();

        info!(endpoint = %self.inner.endpoint, "HTTP subscriber stopped");
    }
}

/// Moves messages from the handler buffer to the subscriber channel.
///
/// Owns the subscriber-channel sender, so the channel cannot close while a
/// send is still possible; it closes exactly when this task exits.
async fn shovel(
    mut pub_rx: mpsc::Receiver<Message>,
    msg_tx: mpsc::Sender<Message>,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            queued = pub_rx.recv() => match queued {
                Some(msg) => {
                    debug!(message_id = %msg.uuid, "delivering message to subscriber");
                    if msg_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = stop_rx.changed() => break,
        }
    }

    drop(msg_tx);
    let _ = done_tx.send(());
}

async fn handle(State(inner): State<Arc<Inner>>, request: Request) -> StatusCode {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(endpoint = %inner.endpoint, error = %e, "error reading request body");
            return StatusCode::BAD_REQUEST;
        }
    };

    let mut actor_iri = None;

    if inner.tokens.verify(&parts) {
        debug!(endpoint = %inner.endpoint, "request verified with bearer token or no authorization required");
    } else {
        debug!(endpoint = %inner.endpoint, "bearer token verification failed, verifying HTTP signature");

        match inner.verifier.verify_request(&parts, &body).await {
            Err(e) => {
                error!(endpoint = %inner.endpoint, error = %e, "error verifying HTTP signature");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
            Ok(Verification::Unverified) => {
                info!(endpoint = %inner.endpoint, "invalid HTTP signature");
                return StatusCode::UNAUTHORIZED;
            }
            Ok(Verification::Verified { actor_iri: actor }) => actor_iri = Some(actor),
        }
    }

    let msg = build_message(body, actor_iri);

    debug!(endpoint = %inner.endpoint, message_id = %msg.uuid, "handling message");

    if let Err(e) = inner.publish(msg.clone()) {
        info!(endpoint = %inner.endpoint, message_id = %msg.uuid, error = %e, "message was not queued");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    inner.respond(&msg).await
}

fn build_message(body: Bytes, actor_iri: Option<String>) -> Message {
    let mut msg = Message::new(body.to_vec());
    if let Some(actor) = actor_iri {
        msg.metadata.insert(ACTOR_IRI_KEY.to_string(), actor);
    }
    msg
}

impl Inner {
    fn publish(&self, msg: Message) -> Result<(), IngressError> {
        self.lifecycle.ensure_started()?;

        self.pub_tx
            .try_send(msg)
            .map_err(|_| IngressError::BufferFull)
    }

    /// Hold the response until the consumer decides or the service stops.
    async fn respond(&self, msg: &Message) -> StatusCode {
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::select! {
            disposition = msg.await_disposition() => match disposition {
                Disposition::Ack => {
                    debug!(message_id = %msg.uuid, "ack received for message");
                    StatusCode::OK
                }
                Disposition::Nack => {
                    warn!(message_id = %msg.uuid, "nack received for message");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            _ = stop_rx.changed() => {
                info!(message_id = %msg.uuid, "message was not handled since service was stopped");
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

#[cfg(test)]
mod tests;
