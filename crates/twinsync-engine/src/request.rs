//! Request lifecycle and the outbound sender task.
//!
//! A request moves `Created -> Sent -> {Acked, Failed}`. `Acked` only means
//! the publish went through; the twin response arrives separately and is not
//! tracked here. Nothing times out at this layer, so a request whose publish
//! never returns stays `Sent`.
//!
//! Finished requests stay queryable only for the most recent
//! [`FINISHED_RETAINED`] of them; older ones are evicted.

use crate::engine::StatusHandler;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use twinsync_proto::{Envelope, OperationType, StatusCode};
use twinsync_transport::{Message, MqttTransport, TransportChannel};

/// Lifecycle state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Envelope built and queued
    Created,
    /// Handed to the transport channel
    Sent,
    /// Publish completed
    Acked,
    /// Publish failed
    Failed,
}

/// A request queued for the sender task.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Engine-assigned request id
    pub request_id: u64,
    /// Envelope to publish
    pub envelope: Envelope,
}

/// How many finished (`Acked` or `Failed`) requests the tracker remembers.
pub const FINISHED_RETAINED: usize = 64;

#[derive(Debug, Default)]
struct Entries {
    states: BTreeMap<u64, (OperationType, RequestState)>,
    finished: VecDeque<u64>,
}

/// Shared view of request states, keyed by request id.
#[derive(Debug, Clone, Default)]
pub struct RequestTracker {
    inner: Arc<Mutex<Entries>>,
}

impl RequestTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly built request.
    pub fn created(&self, request_id: u64, operation: OperationType) {
        self.lock()
            .states
            .insert(request_id, (operation, RequestState::Created));
    }

    /// Move a request to a new state.
    ///
    /// Entering `Acked` or `Failed` may evict the oldest finished request.
    pub fn advance(&self, request_id: u64, state: RequestState) {
        let mut entries = self.lock();
        let Some(entry) = entries.states.get_mut(&request_id) else {
            return;
        };
        tracing::debug!(request_id, operation = %entry.0, from = ?entry.1, to = ?state, "Request state changed");
        let was_finished = is_finished(entry.1);
        entry.1 = state;

        if is_finished(state) && !was_finished {
            entries.finished.push_back(request_id);
            while entries.finished.len() > FINISHED_RETAINED {
                if let Some(evicted) = entries.finished.pop_front() {
                    entries.states.remove(&evicted);
                }
            }
        }
    }

    /// Current state of a request.
    #[must_use]
    pub fn state(&self, request_id: u64) -> Option<RequestState> {
        self.lock().states.get(&request_id).map(|(_, state)| *state)
    }

    /// Operation of a request.
    #[must_use]
    pub fn operation(&self, request_id: u64) -> Option<OperationType> {
        self.lock()
            .states
            .get(&request_id)
            .map(|(operation, _)| *operation)
    }

    /// Requests not yet acked or failed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock()
            .states
            .values()
            .filter(|(_, state)| !is_finished(*state))
            .count()
    }

    /// Requests currently remembered, in flight or finished.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.lock().states.len()
    }
}

fn is_finished(state: RequestState) -> bool {
    matches!(state, RequestState::Acked | RequestState::Failed)
}

/// Spawn the task that publishes queued requests.
///
/// Each publish outcome is reported to `status` as a delivery confirmation:
/// `OkEmpty` on success, `Error` on failure. The task ends when the queue's
/// sending side is dropped.
pub fn spawn_sender<T: MqttTransport>(
    channel: Arc<TransportChannel<T>>,
    mut requests: mpsc::Receiver<OutboundRequest>,
    tracker: RequestTracker,
    status: StatusHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let request_id = request.request_id;
            let operation = request.envelope.operation;

            let payload = match request.envelope.to_cbor() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, request_id, %operation, "Failed to encode envelope");
                    tracker.advance(request_id, RequestState::Failed);
                    status.notify(StatusCode::Error);
                    continue;
                }
            };

            tracker.advance(request_id, RequestState::Sent);
            match channel.send(&Message::new(payload)).await {
                Ok(()) => {
                    tracing::debug!(request_id, %operation, "Twin request delivered");
                    tracker.advance(request_id, RequestState::Acked);
                    status.notify(StatusCode::OkEmpty);
                }
                Err(err) => {
                    tracing::warn!(error = %err, request_id, %operation, "Twin request failed");
                    tracker.advance(request_id, RequestState::Failed);
                    status.notify(StatusCode::Error);
                }
            }
        }

        tracing::debug!("Request queue closed, sender stopping");
    })
}
