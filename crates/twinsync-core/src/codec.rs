//! Twin document codec.
//!
//! The engine treats the document format as opaque and only talks to it
//! through [`TwinCodec`]. [`JsonTwinCodec`] renders the JSON layout used by
//! the hub:
//!
//! - full twin: `{"reported": {...}, "desired": {...}}`, optionally wrapped in
//!   a top-level `"properties"` object
//! - reported diff and pushed desired changes: a flat object of key to value
//! - desired snapshot (subscribe response): a bare desired section, or one
//!   wrapped as `{"desired": {...}}`, optionally inside `"properties"`
//!
//! Keys starting with `$` are metadata. `$version` in a desired section is
//! kept as the section version; other metadata keys are dropped.

use crate::document::{DesiredChanges, TwinDocument};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const VERSION_KEY: &str = "$version";

/// Desired-property changes plus the version they bring the section to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredPatch {
    /// Changed properties
    pub changes: DesiredChanges,
    /// Desired section version, if present
    pub version: Option<i64>,
}

/// Serialization seam between the twin engine and the document format.
pub trait TwinCodec: Send + Sync {
    /// Render a property value into the textual form the codec stores.
    ///
    /// # Errors
    ///
    /// Returns error if the value has no textual rendering.
    fn render_value(&self, key: &str, value: &Value) -> Result<String, CodecError>;

    /// Encode reported properties as a diff payload.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    fn encode_reported_diff(&self, reported: &BTreeMap<String, String>)
        -> Result<Vec<u8>, CodecError>;

    /// Decode a full twin document.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a twin document.
    fn decode_full_twin(&self, bytes: &[u8]) -> Result<TwinDocument, CodecError>;

    /// Decode a pushed desired-property change set.
    ///
    /// Every top-level key is a property, including one named `desired`.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a property object.
    fn decode_desired_changes(&self, bytes: &[u8]) -> Result<DesiredPatch, CodecError>;

    /// Decode the desired snapshot carried by a subscribe response.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a property object.
    fn decode_desired_snapshot(&self, bytes: &[u8]) -> Result<DesiredPatch, CodecError>;
}

/// JSON twin codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTwinCodec;

impl JsonTwinCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TwinCodec for JsonTwinCodec {
    fn render_value(&self, key: &str, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => {
                Err(CodecError::Unrenderable(key.to_string()))
            }
        }
    }

    fn encode_reported_diff(
        &self,
        reported: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(reported).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_full_twin(&self, bytes: &[u8]) -> Result<TwinDocument, CodecError> {
        let root = parse_object(bytes)?;
        let sections = match root.get("properties") {
            Some(Value::Object(inner)) => inner,
            Some(_) => return Err(CodecError::Decode("'properties' is not an object".to_string())),
            None => &root,
        };

        let mut doc = TwinDocument::new();
        if let Some(reported) = section(sections, "reported")? {
            doc.reported = flatten(reported).changes;
        }
        if let Some(desired) = section(sections, "desired")? {
            let patch = flatten(desired);
            doc.desired = patch.changes;
            doc.desired_version = patch.version;
        }
        Ok(doc)
    }

    fn decode_desired_changes(&self, bytes: &[u8]) -> Result<DesiredPatch, CodecError> {
        if bytes.is_empty() {
            return Ok(DesiredPatch::default());
        }
        Ok(flatten(&parse_object(bytes)?))
    }

    fn decode_desired_snapshot(&self, bytes: &[u8]) -> Result<DesiredPatch, CodecError> {
        if bytes.is_empty() {
            return Ok(DesiredPatch::default());
        }
        let root = parse_object(bytes)?;
        let sections = match section(&root, "properties")? {
            Some(inner) => inner,
            None => &root,
        };
        match section(sections, "desired")? {
            Some(desired) => Ok(flatten(desired)),
            None => Ok(flatten(sections)),
        }
    }
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, CodecError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CodecError::Decode("payload is not a JSON object".to_string())),
        Err(e) => Err(CodecError::Decode(e.to_string())),
    }
}

fn section<'a>(
    root: &'a Map<String, Value>,
    name: &str,
) -> Result<Option<&'a Map<String, Value>>, CodecError> {
    match root.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(CodecError::Decode(format!("'{name}' is not an object"))),
    }
}

fn flatten(map: &Map<String, Value>) -> DesiredPatch {
    let mut patch = DesiredPatch::default();
    for (key, value) in map {
        if key == VERSION_KEY {
            patch.version = value.as_i64();
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        patch.changes.insert(key.clone(), text);
    }
    patch
}

/// Errors raised by a twin codec.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Property value cannot be rendered as text
    #[error("value of property '{0}' cannot be rendered")]
    Unrenderable(String),
    /// Encoding failed
    #[error("encode failed: {0}")]
    Encode(String),
    /// Decoding failed
    #[error("decode failed: {0}")]
    Decode(String),
}
