//! Twin synchronization engine.

use crate::request::{spawn_sender, OutboundRequest, RequestState, RequestTracker};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use twinsync_core::{
    CallbackBinding, CodecError, Context, DesiredChanges, Property, PropertyRegistry, TwinCodec,
    TwinDocument,
};
use twinsync_proto::{Envelope, OperationType, StatusCode};
use twinsync_transport::{ChannelError, MqttTransport, TransportChannel};

/// Callback invoked with every operation status.
pub type StatusCallback = Arc<dyn Fn(StatusCode, Option<&Context>) + Send + Sync>;

/// Status callback together with its context.
///
/// Receives both delivery confirmations from the sender task and statuses
/// carried by twin responses, in no defined relative order.
#[derive(Clone)]
pub struct StatusHandler {
    callback: StatusCallback,
    context: Option<Context>,
}

impl StatusHandler {
    /// Create a handler with a caller context.
    pub fn new<F>(callback: F, context: Option<Context>) -> Self
    where
        F: Fn(StatusCode, Option<&Context>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            context,
        }
    }

    /// Report a status.
    pub fn notify(&self, status: StatusCode) {
        (self.callback)(status, self.context.as_ref());
    }
}

impl fmt::Debug for StatusHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusHandler")
            .field("has_context", &self.context.is_some())
            .finish_non_exhaustive()
    }
}

/// Device-side twin engine.
///
/// Owns the property registry, the local twin snapshot, and the request-id
/// counter. Operations take `&mut self`; the owner serializes them with
/// inbound dispatch.
pub struct TwinEngine<C> {
    codec: C,
    registry: PropertyRegistry,
    twin: Option<TwinDocument>,
    next_request_id: u64,
    subscribed: bool,
    outbound: Option<mpsc::Sender<OutboundRequest>>,
    tracker: RequestTracker,
    status: StatusHandler,
    generic: CallbackBinding,
}

impl<C: TwinCodec> TwinEngine<C> {
    /// Create an engine and the queue its requests are submitted on.
    ///
    /// `generic` receives desired-property changes for keys without a
    /// dedicated binding.
    #[must_use]
    pub fn new(
        codec: C,
        status: StatusHandler,
        generic: CallbackBinding,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<OutboundRequest>) {
        let (outbound, requests) = mpsc::channel(capacity.max(1));
        (
            Self {
                codec,
                registry: PropertyRegistry::new(),
                twin: Some(TwinDocument::new()),
                next_request_id: 0,
                subscribed: false,
                outbound: Some(outbound),
                tracker: RequestTracker::new(),
                status,
                generic,
            },
            requests,
        )
    }

    /// Create an engine wired to a channel through a spawned sender task.
    #[must_use]
    pub fn start<T: MqttTransport>(
        codec: C,
        channel: Arc<TransportChannel<T>>,
        status: StatusHandler,
        generic: CallbackBinding,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (engine, requests) = Self::new(codec, status, generic, capacity);
        let sender = spawn_sender(
            channel,
            requests,
            engine.tracker.clone(),
            engine.status.clone(),
        );
        (engine, sender)
    }

    /// Request the full twin.
    ///
    /// Returns the request id.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` after shutdown.
    pub async fn request_twin(&mut self) -> Result<String, TwinError> {
        self.ensure_initialized()?;
        self.submit(OperationType::GetRequest, Vec::new()).await
    }

    /// Report property values to the cloud.
    ///
    /// Returns the request id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty set or a value the codec cannot
    /// render, and `NotInitialized` after shutdown. Nothing is sent on error.
    pub async fn update_reported_properties(
        &mut self,
        properties: &[Property],
    ) -> Result<String, TwinError> {
        if properties.is_empty() {
            return Err(TwinError::InvalidArgument(
                "reported properties cannot be empty".to_string(),
            ));
        }
        self.ensure_initialized()?;

        let mut reported = BTreeMap::new();
        for property in properties {
            let text = self.codec.render_value(property.key(), property.value())?;
            reported.insert(property.key().to_string(), text);
        }
        let body = self.codec.encode_reported_diff(&reported)?;

        let request_id = self
            .submit(OperationType::UpdateReportedRequest, body)
            .await?;

        for property in properties {
            self.registry.record_reported(property.clone());
        }
        if let Some(twin) = self.twin.as_mut() {
            twin.merge_reported(&reported);
        }

        tracing::info!(request_id, count = reported.len(), "Reported properties submitted");
        Ok(request_id)
    }

    /// Subscribe to desired-property changes.
    ///
    /// Changes to a key present in `bindings` go to its callback; all other
    /// keys go to the generic callback. Allowed once per engine.
    ///
    /// Returns the request id.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubscribed` on any call after a successful one, and
    /// `NotInitialized` after shutdown. A request that cannot be queued leaves
    /// the engine unsubscribed and the bindings unrecorded.
    pub async fn subscribe_desired_properties(
        &mut self,
        bindings: impl IntoIterator<Item = (Property, CallbackBinding)>,
    ) -> Result<String, TwinError> {
        if self.subscribed {
            return Err(TwinError::AlreadySubscribed);
        }
        self.ensure_initialized()?;

        let bindings: Vec<_> = bindings.into_iter().collect();
        let request_id = self
            .submit(OperationType::SubscribeDesiredRequest, Vec::new())
            .await?;

        for (property, binding) in bindings {
            self.registry.record_desired(property, binding);
        }
        self.subscribed = true;

        tracing::info!(
            request_id,
            bound = self.registry.desired_len(),
            "Subscribed to desired properties"
        );
        Ok(request_id)
    }

    /// Dispatch an inbound twin envelope.
    pub fn handle_envelope(&mut self, envelope: Envelope) {
        let status = envelope.status_code();
        if let Some(status) = status {
            self.status.notify(status);
        }

        tracing::debug!(
            operation = %envelope.operation,
            request_id = ?envelope.request_id,
            status = ?status,
            body_len = envelope.body.len(),
            "Received twin response"
        );

        match envelope.operation {
            OperationType::GetResponse => {
                if status == Some(StatusCode::Ok) {
                    self.replace_twin(&envelope.body);
                }
            }
            OperationType::UpdateReportedResponse => {}
            OperationType::SubscribeDesiredResponse => match status {
                Some(StatusCode::Ok) => self.apply_desired(&envelope.body, true),
                None => self.apply_desired(&envelope.body, false),
                Some(_) => {}
            },
            request => {
                tracing::warn!(operation = %request, "Ignoring inbound twin request");
            }
        }
    }

    /// Decode and dispatch an inbound twin payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the payload is not an envelope.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Result<(), TwinError> {
        let envelope = Envelope::from_cbor(payload)
            .map_err(|e| TwinError::InvalidArgument(e.to_string()))?;
        self.handle_envelope(envelope);
        Ok(())
    }

    /// Route each desired change to its callback.
    ///
    /// Each entry is removed from the map as it is delivered, so a key is
    /// delivered at most once per call.
    pub fn dispatch_desired(&mut self, mut changes: DesiredChanges) {
        while let Some((key, value)) = changes.pop_first() {
            match self.registry.lookup_desired_callback(&key) {
                Some(binding) => binding.invoke(&key, &value),
                None => self.generic.invoke(&key, &value),
            }
            if let Some(twin) = self.twin.as_mut() {
                twin.set_desired(&key, &value);
            }
        }
    }

    /// Tear down the twin state and close the request queue.
    ///
    /// Later operations fail with `NotInitialized`.
    pub fn shutdown(&mut self) {
        self.twin = None;
        self.outbound = None;
        tracing::info!(
            in_flight = self.tracker.in_flight(),
            "Twin engine shut down"
        );
    }

    /// Local twin snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<&TwinDocument> {
        self.twin.as_ref()
    }

    /// Property registry.
    #[must_use]
    pub fn registry(&self) -> &PropertyRegistry {
        &self.registry
    }

    /// Request state tracker.
    #[must_use]
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// State of a request by id.
    #[must_use]
    pub fn request_state(&self, request_id: &str) -> Option<RequestState> {
        request_id
            .parse()
            .ok()
            .and_then(|id| self.tracker.state(id))
    }

    /// Whether desired properties have been subscribed.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    fn ensure_initialized(&self) -> Result<(), TwinError> {
        if self.twin.is_none() || self.outbound.is_none() {
            return Err(TwinError::NotInitialized);
        }
        Ok(())
    }

    async fn submit(&mut self, operation: OperationType, body: Vec<u8>) -> Result<String, TwinError> {
        let outbound = self.outbound.as_ref().ok_or(TwinError::NotInitialized)?;

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let envelope = Envelope::request(operation, request_id, body);
        self.tracker.created(request_id, operation);

        outbound
            .send(OutboundRequest {
                request_id,
                envelope,
            })
            .await
            .map_err(|_| {
                self.tracker.advance(request_id, RequestState::Failed);
                TwinError::InvalidState("request queue closed".to_string())
            })?;

        Ok(request_id.to_string())
    }

    fn replace_twin(&mut self, body: &[u8]) {
        match self.codec.decode_full_twin(body) {
            Ok(document) => {
                if let Some(twin) = self.twin.as_mut() {
                    twin.replace(document);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to decode twin document");
            }
        }
    }

    fn apply_desired(&mut self, body: &[u8], snapshot: bool) {
        let decoded = if snapshot {
            self.codec.decode_desired_snapshot(body)
        } else {
            self.codec.decode_desired_changes(body)
        };
        let patch = match decoded {
            Ok(patch) => patch,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to decode desired properties");
                return;
            }
        };

        if let (Some(twin), Some(version)) = (self.twin.as_mut(), patch.version) {
            twin.desired_version = Some(version);
        }
        self.dispatch_desired(patch.changes);
    }
}

/// Errors raised by twin operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TwinError {
    /// Caller input is missing or cannot be encoded
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation invoked in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Desired properties were already subscribed
    #[error("already subscribed to desired property changes")]
    AlreadySubscribed,
    /// The transport session is gone
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The twin state does not exist
    #[error("twin is not initialized")]
    NotInitialized,
}

impl From<CodecError> for TwinError {
    fn from(err: CodecError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<ChannelError> for TwinError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            ChannelError::InvalidState(msg) => Self::InvalidState(msg),
            ChannelError::ConnectionLost(msg) => Self::ConnectionLost(msg),
            ChannelError::Transport(err) => Self::ConnectionLost(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use twinsync_core::JsonTwinCodec;

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    fn recording_binding(seen: &Seen) -> CallbackBinding {
        let sink = Arc::clone(seen);
        CallbackBinding::without_context(move |key, value, _| {
            sink.lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
        })
    }

    fn engine(generic: &Seen) -> (TwinEngine<JsonTwinCodec>, mpsc::Receiver<OutboundRequest>) {
        TwinEngine::new(
            JsonTwinCodec::new(),
            StatusHandler::new(|_, _| {}, None),
            recording_binding(generic),
            8,
        )
    }

    #[tokio::test]
    async fn dispatch_routes_bound_and_generic_keys() {
        let generic: Seen = Arc::default();
        let bound: Seen = Arc::default();
        let (mut engine, _requests) = engine(&generic);
        engine
            .subscribe_desired_properties([(Property::new("temp", ""), recording_binding(&bound))])
            .await
            .unwrap();

        let mut changes = DesiredChanges::new();
        changes.insert("temp".to_string(), "72".to_string());
        changes.insert("mode".to_string(), "auto".to_string());
        engine.dispatch_desired(changes);

        assert_eq!(
            bound.lock().unwrap().as_slice(),
            &[("temp".to_string(), "72".to_string())]
        );
        assert_eq!(
            generic.lock().unwrap().as_slice(),
            &[("mode".to_string(), "auto".to_string())]
        );
        assert_eq!(engine.snapshot().unwrap().desired("temp"), Some("72"));
    }

    #[tokio::test]
    async fn request_ids_increase_from_zero() {
        let generic: Seen = Arc::default();
        let (mut engine, mut requests) = engine(&generic);

        assert_eq!(engine.request_twin().await.unwrap(), "0");
        assert_eq!(engine.request_twin().await.unwrap(), "1");

        let first = requests.recv().await.unwrap();
        let second = requests.recv().await.unwrap();
        assert_eq!(first.envelope.request_id.as_deref(), Some("0"));
        assert_eq!(second.request_id, 1);
        assert!(first.envelope.body.is_empty());
        assert_eq!(engine.request_state("1"), Some(RequestState::Created));
    }

    #[tokio::test]
    async fn closed_queue_marks_request_failed() {
        let generic: Seen = Arc::default();
        let (mut engine, requests) = engine(&generic);
        drop(requests);

        let result = engine.request_twin().await;

        assert!(matches!(result, Err(TwinError::InvalidState(_))));
        assert_eq!(engine.tracker().state(0), Some(RequestState::Failed));
    }

    #[tokio::test]
    async fn failed_subscribe_can_be_retried() {
        let generic: Seen = Arc::default();
        let (mut engine, requests) = engine(&generic);
        drop(requests);

        let first = engine
            .subscribe_desired_properties([(Property::new("temp", ""), recording_binding(&generic))])
            .await;
        assert!(matches!(first, Err(TwinError::InvalidState(_))));
        assert!(!engine.is_subscribed());
        assert_eq!(engine.registry().desired_len(), 0);

        let second = engine.subscribe_desired_properties(Vec::new()).await;
        assert!(matches!(second, Err(TwinError::InvalidState(_))));
    }

    #[test]
    fn subscribe_response_dispatches_only_on_ok_or_push() {
        let generic: Seen = Arc::default();
        let (mut engine, _requests) = engine(&generic);

        engine.handle_envelope(Envelope::response(
            OperationType::SubscribeDesiredResponse,
            "0",
            204,
            br#"{"fan":"high"}"#.to_vec(),
        ));
        assert!(generic.lock().unwrap().is_empty());

        engine.handle_envelope(Envelope::response(
            OperationType::SubscribeDesiredResponse,
            "0",
            200,
            br#"{"desired":{"fan":"low"}}"#.to_vec(),
        ));
        engine.handle_envelope(Envelope::desired_notification(
            br#"{"desired":{"nested":true}}"#.to_vec(),
        ));

        assert_eq!(
            generic.lock().unwrap().as_slice(),
            &[
                ("fan".to_string(), "low".to_string()),
                ("desired".to_string(), r#"{"nested":true}"#.to_string()),
            ]
        );
    }

    #[test]
    fn channel_errors_map_onto_twin_errors() {
        let lost: TwinError = ChannelError::ConnectionLost("gone".to_string()).into();
        assert!(matches!(lost, TwinError::ConnectionLost(_)));

        let state: TwinError = ChannelError::InvalidState("race".to_string()).into();
        assert!(matches!(state, TwinError::InvalidState(_)));
    }
}
