//! # Twin-Sync Core
//!
//! Device-side data model for twin synchronization.
//!
//! This crate provides:
//! - `Property` and `CallbackBinding`, the units a device registers
//! - `PropertyRegistry` holding reported properties and desired-property callbacks
//! - `TwinDocument`, the local snapshot of the cloud-held twin
//! - `TwinCodec`, the seam to the twin document serialization format, with a JSON codec

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod document;
pub mod property;
pub mod registry;

pub use codec::{CodecError, DesiredPatch, JsonTwinCodec, TwinCodec};
pub use document::{DesiredChanges, TwinDocument};
pub use property::{CallbackBinding, Context, Property, PropertyCallback};
pub use registry::PropertyRegistry;
