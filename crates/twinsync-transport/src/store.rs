//! Received-message store.
//!
//! Inbound messages are queued per topic and topics iterate in sorted order.
//! Each payload is handed out exactly once, oldest first within a topic. The
//! store exists only while the channel is open; reading a closed store is an
//! invalid-state condition rather than an empty result.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Messages = Option<BTreeMap<String, VecDeque<Vec<u8>>>>;

/// Topic-keyed queues of received payloads.
#[derive(Debug)]
pub struct ReceivedStore {
    messages: Mutex<Messages>,
}

impl Default for ReceivedStore {
    fn default() -> Self {
        Self::open()
    }
}

impl ReceivedStore {
    /// Create an open, empty store.
    #[must_use]
    pub fn open() -> Self {
        Self {
            messages: Mutex::new(Some(BTreeMap::new())),
        }
    }

    /// Create a store that is not yet initialized.
    #[must_use]
    pub fn closed() -> Self {
        Self {
            messages: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Messages> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the store if it is closed. Existing messages are kept.
    pub fn reopen(&self) {
        let mut messages = self.lock();
        if messages.is_none() {
            *messages = Some(BTreeMap::new());
        }
    }

    /// Drop the store and every pending message.
    ///
    /// Returns how many messages were discarded.
    pub fn close(&self) -> usize {
        self.lock().take().map_or(0, |messages| count(&messages))
    }

    /// Whether the store is initialized.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Queue a message behind any pending payloads on the same topic.
    ///
    /// Returns `false` if the store is closed and the message was dropped.
    pub fn insert(&self, topic: String, payload: Vec<u8>) -> bool {
        let mut messages = self.lock();
        let Some(messages) = messages.as_mut() else {
            return false;
        };
        let queue = messages.entry(topic).or_default();
        queue.push_back(payload);
        if queue.len() > 1 {
            tracing::debug!(pending = queue.len(), "Queued message behind unconsumed ones");
        }
        true
    }

    /// First topic, in store order, accepted by `accept`.
    ///
    /// Returns `None` if the store is closed; callers distinguish that from
    /// an empty match with [`ReceivedStore::is_open`].
    pub fn find_topic(&self, accept: impl Fn(&str) -> bool) -> Option<Option<String>> {
        let messages = self.lock();
        let messages = messages.as_ref()?;
        Some(messages.keys().find(|topic| accept(topic)).cloned())
    }

    /// Remove and return the oldest payload queued under `topic`.
    ///
    /// The outer `None` means the store is closed.
    pub fn take(&self, topic: &str) -> Option<Option<Vec<u8>>> {
        let mut messages = self.lock();
        let messages = messages.as_mut()?;
        let Some(queue) = messages.get_mut(topic) else {
            return Some(None);
        };
        let payload = queue.pop_front();
        if queue.is_empty() {
            messages.remove(topic);
        }
        Some(payload)
    }

    /// Number of pending messages; zero when closed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, count)
    }

    /// Whether no messages are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn count(messages: &BTreeMap<String, VecDeque<Vec<u8>>>) -> usize {
    messages.values().map(VecDeque::len).sum()
}
