//! # Twin-Sync Engine
//!
//! Device-side twin synchronization on top of a [`TransportChannel`].
//!
//! The engine issues twin operations (get, update reported, subscribe
//! desired), correlates the asynchronous responses, and routes desired
//! property changes to registered callbacks.
//!
//! ## Tasks
//!
//! - the caller owns the [`TwinEngine`] and invokes operations on it
//! - a sender task publishes queued requests and reports delivery status
//! - the transport driver stores inbound messages; [`drain_inbound`] hands
//!   twin envelopes back to the engine
//!
//! [`TransportChannel`]: twinsync_transport::TransportChannel

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod inbound;
pub mod request;

pub use engine::{StatusCallback, StatusHandler, TwinEngine, TwinError};
pub use inbound::drain_inbound;
pub use request::{
    spawn_sender, OutboundRequest, RequestState, RequestTracker, FINISHED_RETAINED,
};
