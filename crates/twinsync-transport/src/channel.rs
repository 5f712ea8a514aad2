//! Topic-routed transport channel.

use crate::gate::{Gate, GateClosed};
use crate::store::ReceivedStore;
use std::future::Future;
use tokio::sync::{mpsc, watch};
use twinsync_proto::TopicScheme;

/// Low-level MQTT session the channel drives.
///
/// The channel customizes the session (it subscribes its own filter), so
/// [`MqttTransport::reset`] must bring it back to its base configuration.
pub trait MqttTransport: Send + Sync + 'static {
    /// Establish the broker session.
    fn connect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to a topic filter.
    fn subscribe(&self, filter: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publish a payload.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tear down the broker session.
    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Return to the base, idle configuration.
    fn reset(&self);
}

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connected and subscribed
    Connected,
    /// Reconnect in progress; traffic is paused
    Reconnecting,
}

/// Wake-up sent to the consumer when a message lands in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundNotice {
    /// Topic the message arrived on
    pub topic: String,
}

/// An outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Option<Vec<u8>>,
}

impl Message {
    /// Create a message with a payload.
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload: Some(payload),
        }
    }

    /// Create a message without a payload. Sending it is rejected.
    #[must_use]
    pub fn empty() -> Self {
        Self { payload: None }
    }

    /// The payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// Publish/subscribe channel for one device.
pub struct TransportChannel<T> {
    transport: T,
    scheme: TopicScheme,
    gate: Gate,
    store: ReceivedStore,
    state: watch::Sender<SessionState>,
    inbound: mpsc::Sender<InboundNotice>,
}

impl<T: MqttTransport> TransportChannel<T> {
    /// Create a channel.
    ///
    /// Returns the channel and the receiver woken for every stored message.
    /// Wake-ups are dropped when `capacity` is exhausted; a consumer that
    /// drains the store on each wake-up loses nothing.
    #[must_use]
    pub fn new(
        transport: T,
        scheme: TopicScheme,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<InboundNotice>) {
        let (inbound, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(SessionState::Disconnected);

        tracing::debug!(
            device_id = %scheme.device_id,
            kind = %scheme.kind,
            publish = %scheme.publish_topic(),
            subscribe = %scheme.subscribe_filter(),
            "Created transport channel"
        );

        (
            Self {
                transport,
                scheme,
                gate: Gate::new(),
                store: ReceivedStore::open(),
                state,
                inbound,
            },
            rx,
        )
    }

    /// Topic scheme in use.
    #[must_use]
    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch session state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether no operation currently holds the gate.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.gate.is_free()
    }

    /// Connect and subscribe to the channel's filter.
    ///
    /// # Errors
    ///
    /// Returns error if the gate is closed or the transport fails.
    pub async fn start(&self) -> Result<(), ChannelError> {
        let _permit = self.gate.acquire().await?;

        self.store.reopen();
        self.transport.connect().await?;

        let filter = self.scheme.subscribe_filter();
        self.transport.subscribe(&filter).await?;
        self.state.send_replace(SessionState::Connected);

        tracing::info!(filter, "Transport channel started");
        Ok(())
    }

    /// Disconnect and reset the transport to its base configuration.
    ///
    /// Pending received messages are discarded.
    ///
    /// # Errors
    ///
    /// Returns error if the gate is closed or disconnect fails; the transport
    /// is reset in either case.
    pub async fn stop(&self) -> Result<(), ChannelError> {
        let permit = self.gate.acquire().await;
        let result = match &permit {
            Ok(_) => self.transport.disconnect().await.map_err(ChannelError::from),
            Err(closed) => Err(ChannelError::from(*closed)),
        };

        self.transport.reset();
        let discarded = self.store.close();
        self.state.send_replace(SessionState::Disconnected);
        drop(permit);

        tracing::info!(discarded, "Transport channel stopped");
        result
    }

    /// Publish a message on the channel's publish topic.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the message has no payload, or error if
    /// the gate is closed or publish fails.
    pub async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let Some(payload) = message.payload() else {
            return Err(ChannelError::InvalidArgument(
                "message payload cannot be empty".to_string(),
            ));
        };

        let _permit = self.gate.acquire().await?;
        let topic = self.scheme.publish_topic();

        tracing::debug!(topic, payload_len = payload.len(), "Publishing message");
        self.transport.publish(&topic, payload.to_vec()).await?;
        Ok(())
    }

    /// Pause all channel operations until [`TransportChannel::on_reconnect_complete`].
    ///
    /// Returns once the gate is held.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` if the gate is closed.
    pub async fn on_reconnect_begin(&self) -> Result<(), ChannelError> {
        tracing::info!("Pausing device messaging during reconnect");
        self.state.send_replace(SessionState::Reconnecting);
        self.gate.hold().await?;
        Ok(())
    }

    /// Resume channel operations after a reconnect attempt.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` if the reconnect failed. The gate is released
    /// either way.
    pub async fn on_reconnect_complete(&self, success: bool) -> Result<(), ChannelError> {
        if !self.gate.release_held().await {
            tracing::warn!("Reconnect completed without a matching reconnect begin");
        }

        if success {
            tracing::info!("Continuing device messaging after reconnect");
            self.state.send_replace(SessionState::Connected);
            Ok(())
        } else {
            self.state.send_replace(SessionState::Disconnected);
            Err(ChannelError::ConnectionLost(
                "could not reconnect to broker".to_string(),
            ))
        }
    }

    /// Queue an inbound message and wake the consumer.
    ///
    /// Called by the transport driver for every received publish.
    pub fn deliver(&self, topic: String, payload: Vec<u8>) {
        let payload_len = payload.len();
        if !self.store.insert(topic.clone(), payload) {
            tracing::warn!(topic, payload_len, "Channel stopped, dropping inbound message");
            return;
        }

        tracing::debug!(topic, payload_len, "Stored inbound message");
        match self.inbound.try_send(InboundNotice { topic }) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Inbound receiver dropped");
            }
        }
    }

    /// Find a received topic that belongs to this channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the store is not initialized.
    pub fn parse_topic(&self) -> Result<Option<String>, ChannelError> {
        self.store
            .find_topic(|topic| self.scheme.matches(topic))
            .ok_or_else(|| ChannelError::InvalidState("received store is not initialized".into()))
    }

    /// Remove and return the oldest payload for a topic found by
    /// [`TransportChannel::parse_topic`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the store is not initialized or the topic is
    /// no longer present.
    pub fn parse_payload(&self, topic: Option<&str>) -> Result<Option<Vec<u8>>, ChannelError> {
        let Some(topic) = topic else {
            return Ok(None);
        };

        match self.store.take(topic) {
            None => Err(ChannelError::InvalidState(
                "received store is not initialized".to_string(),
            )),
            Some(None) => Err(ChannelError::InvalidState(format!(
                "topic '{topic}' is not present in received store"
            ))),
            Some(Some(payload)) => Ok(Some(payload)),
        }
    }

    /// Take the next message for this channel, if any.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the store is not initialized.
    pub fn next_message(&self) -> Result<Option<(String, Vec<u8>)>, ChannelError> {
        let Some(topic) = self.parse_topic()? else {
            return Ok(None);
        };
        let payload = self.parse_payload(Some(&topic))?.unwrap_or_default();
        Ok(Some((topic, payload)))
    }

    /// Close the gate permanently; pending and future operations fail.
    pub fn close(&self) {
        self.gate.close();
    }
}

/// Errors raised by the low-level transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Invalid broker URL
    #[error("invalid MQTT URL: {0}")]
    InvalidUrl(String),
    /// Connection failed
    #[error("connection error: {0}")]
    Connect(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Disconnect failed
    #[error("disconnect error: {0}")]
    Disconnect(String),
}

/// Errors raised by the channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Caller input is missing or malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation invoked in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The session is gone and will not come back
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<GateClosed> for ChannelError {
    fn from(_: GateClosed) -> Self {
        Self::ConnectionLost("channel gate closed".to_string())
    }
}
