//! # Twin-Sync Protocol
//!
//! Twin message envelope and MQTT topic scheme.
//!
//! ## Envelope
//!
//! Every twin exchange is wrapped in an [`Envelope`] carrying the operation
//! type, a request id for correlation, an optional hub status, and the
//! codec-rendered body. Envelopes travel as CBOR.
//!
//! ## MQTT Topics
//!
//! Messaging channel for device `D`:
//! - publish: `devices/D/messages/events/`
//! - subscribe: `devices/D/messages/devicebound/#`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod topics;

pub use envelope::{Envelope, EnvelopeError, OperationType, StatusCode};
pub use topics::{ChannelKind, MessageClass, TopicScheme};
