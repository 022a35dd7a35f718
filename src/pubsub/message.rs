//! Broker messages with one-shot acknowledgement.
//!
//! A [`Message`] is shared between the broker and a consumer; clones share
//! the same acknowledgement state. The consumer emits exactly one of
//! ack/nack; whichever fires first wins and later calls are ignored. The
//! broker side observes the outcome with [`Message::await_disposition`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

/// Terminal acknowledgement outcome for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

/// A message flowing through the broker.
///
/// Payload and metadata are opaque to the broker; metadata is copied
/// verbatim into transport headers.
#[derive(Clone)]
pub struct Message {
    /// Unique message ID.
    pub uuid: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// String metadata carried alongside the payload.
    pub metadata: HashMap<String, String>,

    state: Arc<AckState>,
}

struct AckState {
    tx: watch::Sender<Option<Disposition>>,
}

impl Message {
    /// Create a message with a fresh UUID.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_uuid(Uuid::new_v4().to_string(), payload)
    }

    /// Create a message with an explicit UUID (used when reconstructing a
    /// message from the wire).
    pub fn with_uuid(uuid: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            metadata: HashMap::new(),
            state: Arc::new(AckState { tx }),
        }
    }

    /// Acknowledge the message. Returns true if this call decided the
    /// outcome; false if ack or nack was already emitted.
    pub fn ack(&self) -> bool {
        self.signal(Disposition::Ack)
    }

    /// Negatively acknowledge the message. Returns true if this call
    /// decided the outcome.
    pub fn nack(&self) -> bool {
        self.signal(Disposition::Nack)
    }

    /// The outcome, if one has been emitted.
    pub fn disposition(&self) -> Option<Disposition> {
        *self.state.tx.borrow()
    }

    /// Wait for the terminal outcome.
    ///
    /// Resolves immediately if ack or nack was already emitted.
    pub async fn await_disposition(&self) -> Disposition {
        let mut rx = self.state.tx.subscribe();
        loop {
            if let Some(d) = *rx.borrow_and_update() {
                return d;
            }
            if rx.changed().await.is_err() {
                // All senders gone without a signal; treat as dropped.
                return Disposition::Nack;
            }
        }
    }

    fn signal(&self, d: Disposition) -> bool {
        self.state.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(d);
                true
            } else {
                false
            }
        })
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .field("disposition", &self.disposition())
            .finish()
    }
}
