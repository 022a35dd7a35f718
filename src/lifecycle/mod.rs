//! Component lifecycle tracking.
//!
//! Every long-lived service in the node (broker, ingress subscriber) moves
//! through the same four states: `NotStarted → Started → Stopping → Stopped`.
//! Transitions are exactly-once: the boolean returned by [`Lifecycle::start`]
//! and [`Lifecycle::begin_stop`] tells the caller whether it won the
//! transition and therefore owns the associated start/stop work.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Started,
    Stopping,
    Stopped,
}

const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// Error returned by operations that require a started service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not started")]
pub struct NotStartedError;

/// Tracks the lifecycle state of a named service.
pub struct Lifecycle {
    name: String,
    state: AtomicU8,
}

impl Lifecycle {
    /// Create a lifecycle in the `NotStarted` state.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(NOT_STARTED),
        }
    }

    /// Name of the service this lifecycle tracks.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> State {
        match self.state.load(Ordering::SeqCst) {
            NOT_STARTED => State::NotStarted,
            STARTED => State::Started,
            STOPPING => State::Stopping,
            _ => State::Stopped,
        }
    }

    /// Transition `NotStarted → Started`.
    ///
    /// Returns true if this call performed the transition. The caller runs
    /// its start hook only on true, so the hook executes exactly once.
    pub fn start(&self) -> bool {
        self.state
            .compare_exchange(NOT_STARTED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Transition `Started → Stopping`.
    ///
    /// Returns true if this call performed the transition; the caller then
    /// runs its stop hook and finishes with [`Lifecycle::finish_stop`].
    pub fn begin_stop(&self) -> bool {
        self.state
            .compare_exchange(STARTED, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Transition `Stopping → Stopped`.
    pub fn finish_stop(&self) {
        let _ = self.state.compare_exchange(
            STOPPING,
            STOPPED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Fail with [`NotStartedError`] unless the service is `Started`.
    pub fn ensure_started(&self) -> Result<(), NotStartedError> {
        if self.state() == State::Started {
            Ok(())
        } else {
            Err(NotStartedError)
        }
    }
}
