//! # Twin-Sync Transport
//!
//! Publish/subscribe channel for one device, layered on a low-level MQTT
//! transport.
//!
//! The channel owns:
//! - a single-slot [`Gate`] serializing `start`, `stop`, `send` and the
//!   reconnect hooks, held across a reconnect
//! - a [`ReceivedStore`] of inbound `(topic, payload)` pairs that the engine
//!   drains with `parse_topic` / `parse_payload`
//!
//! [`RumqttTransport`] and [`drive_eventloop`] connect the channel to a broker
//! through `rumqttc`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod gate;
pub mod mqtt;
pub mod store;

pub use channel::{
    ChannelError, InboundNotice, Message, MqttTransport, SessionState, TransportChannel,
    TransportError,
};
pub use gate::{Gate, GateClosed};
pub use mqtt::{drive_eventloop, parse_mqtt_url, RumqttConfig, RumqttTransport};
pub use store::ReceivedStore;
