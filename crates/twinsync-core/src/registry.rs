//! Locally known reported properties and desired-property callbacks.
//!
//! The registry is owned by a single twin engine and is not synchronized.
//! - Reported properties form a set under `(key, value)` equality, so the same
//!   key may appear more than once with different values.
//! - Desired properties are indexed by key; registering a key again replaces
//!   the earlier binding.

use crate::property::{CallbackBinding, Property};
use std::collections::BTreeMap;

/// Reported and desired property bookkeeping for one twin session.
#[derive(Debug, Default)]
pub struct PropertyRegistry {
    reported: Vec<Property>,
    desired: BTreeMap<String, (Property, CallbackBinding)>,
}

impl PropertyRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a property has been reported.
    pub fn record_reported(&mut self, property: Property) {
        if self.reported.contains(&property) {
            return;
        }
        self.reported.push(property);
    }

    /// Bind a callback to a desired property, replacing any earlier binding for its key.
    pub fn record_desired(&mut self, property: Property, binding: CallbackBinding) {
        let key = property.key().to_string();
        if self.desired.contains_key(&key) {
            tracing::debug!(key = %key, "Replacing desired-property binding");
        }
        self.desired.insert(key, (property, binding));
    }

    /// Find the callback bound to a desired-property key.
    #[must_use]
    pub fn lookup_desired_callback(&self, key: &str) -> Option<&CallbackBinding> {
        self.desired.get(key).map(|(_, binding)| binding)
    }

    /// Properties reported so far.
    #[must_use]
    pub fn reported(&self) -> &[Property] {
        &self.reported
    }

    /// Keys with a bound desired-property callback.
    pub fn desired_keys(&self) -> impl Iterator<Item = &str> {
        self.desired.keys().map(String::as_str)
    }

    /// Number of desired-property bindings.
    #[must_use]
    pub fn desired_len(&self) -> usize {
        self.desired.len()
    }

    /// Check whether nothing has been reported or bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reported.is_empty() && self.desired.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn reported_absorbs_equal_pairs() {
        let mut registry = PropertyRegistry::new();

        registry.record_reported(Property::new("temp", "72"));
        registry.record_reported(Property::new("temp", "72"));
        registry.record_reported(Property::new("temp", "68"));

        assert_eq!(registry.reported().len(), 2);
    }

    #[test]
    fn desired_last_write_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut registry = PropertyRegistry::new();

        let counter = Arc::clone(&first);
        registry.record_desired(
            Property::new("temp", "0"),
            CallbackBinding::without_context(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&second);
        registry.record_desired(
            Property::new("temp", "1"),
            CallbackBinding::without_context(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry
            .lookup_desired_callback("temp")
            .unwrap()
            .invoke("temp", "72");

        assert_eq!(registry.desired_len(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lookup_misses_unknown_key() {
        let registry = PropertyRegistry::new();
        assert!(registry.lookup_desired_callback("mode").is_none());
        assert!(registry.is_empty());
    }
}
