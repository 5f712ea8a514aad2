//! Properties and the callbacks bound to them.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque caller context handed back to a callback on every invocation.
pub type Context = Arc<dyn Any + Send + Sync>;

/// Callback invoked with `(key, value, context)` when a desired property changes.
pub type PropertyCallback = Arc<dyn Fn(&str, &str, Option<&Context>) + Send + Sync>;

/// A single twin property.
///
/// Equality compares the `(key, value)` pair. Lookups in the desired-property
/// index only ever use the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    key: String,
    value: serde_json::Value,
}

impl Property {
    /// Create a new property.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Property key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Property value.
    #[must_use]
    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }
}

/// A desired-property callback together with its context.
#[derive(Clone)]
pub struct CallbackBinding {
    callback: PropertyCallback,
    context: Option<Context>,
}

impl CallbackBinding {
    /// Bind a callback with a caller-supplied context.
    pub fn new<F>(callback: F, context: Context) -> Self
    where
        F: Fn(&str, &str, Option<&Context>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            context: Some(context),
        }
    }

    /// Bind a callback that receives no context.
    pub fn without_context<F>(callback: F) -> Self
    where
        F: Fn(&str, &str, Option<&Context>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            context: None,
        }
    }

    /// The bound context, if any.
    #[must_use]
    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Invoke the callback for a changed property.
    pub fn invoke(&self, key: &str, value: &str) {
        (self.callback)(key, value, self.context.as_ref());
    }
}

impl fmt::Debug for CallbackBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackBinding")
            .field("has_context", &self.context.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn property_equality_is_pairwise() {
        let a = Property::new("temp", "72");
        let b = Property::new("temp", "72");
        let c = Property::new("temp", "68");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.key(), c.key());
    }

    #[test]
    fn binding_passes_context_through() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx: Context = Arc::new(7_u32);

        let binding = CallbackBinding::new(
            move |key, value, context| {
                let tag = context
                    .and_then(|c| c.downcast_ref::<u32>())
                    .copied()
                    .unwrap_or_default();
                sink.lock()
                    .unwrap()
                    .push((key.to_string(), value.to_string(), tag));
            },
            ctx,
        );

        binding.invoke("mode", "auto");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("mode".to_string(), "auto".to_string(), 7)]);
    }
}
