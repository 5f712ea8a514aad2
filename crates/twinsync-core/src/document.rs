//! Local snapshot of the cloud-held twin document.
//!
//! Both sections map a property key to its textual value:
//! - `reported`: what the device last told the cloud
//! - `desired`: what the cloud wants the device to apply

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired-property changes decoded from one payload, in key order.
pub type DesiredChanges = BTreeMap<String, String>;

/// The device's view of its twin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinDocument {
    /// Reported properties
    pub reported: BTreeMap<String, String>,
    /// Desired properties
    pub desired: BTreeMap<String, String>,
    /// Version of the desired section, when the cloud sent one
    pub desired_version: Option<i64>,
}

impl TwinDocument {
    /// Create an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot with a freshly decoded twin.
    pub fn replace(&mut self, other: TwinDocument) {
        tracing::debug!(
            reported = other.reported.len(),
            desired = other.desired.len(),
            desired_version = ?other.desired_version,
            "Replaced twin snapshot"
        );
        *self = other;
    }

    /// Merge one desired-property value into the snapshot.
    pub fn set_desired(&mut self, key: &str, value: &str) {
        self.desired.insert(key.to_string(), value.to_string());
    }

    /// Merge reported-property values into the snapshot.
    pub fn merge_reported(&mut self, reported: &BTreeMap<String, String>) {
        for (key, value) in reported {
            self.reported.insert(key.clone(), value.clone());
        }
    }

    /// Get a desired value.
    #[must_use]
    pub fn desired(&self, key: &str) -> Option<&str> {
        self.desired.get(key).map(String::as_str)
    }

    /// Get a reported value.
    #[must_use]
    pub fn reported(&self, key: &str) -> Option<&str> {
        self.reported.get(key).map(String::as_str)
    }

    /// Check if the document holds no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reported.is_empty() && self.desired.is_empty()
    }
}
