//! MQTT topic scheme for a device channel.
//!
//! Every channel shares the same transport core and differs only in its topic
//! set and in how it classifies inbound payloads:
//!
//! | Kind | Publish | Subscribe |
//! |---|---|---|
//! | `Messaging` | `devices/D/messages/events/` | `devices/D/messages/devicebound/#` |
//! | `Twin` | `$iothub/twin/D/requests/` | `$iothub/twin/D/responses/#` |

use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which topic set a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Device-to-cloud events and cloud-to-device messages
    #[default]
    Messaging,
    /// Dedicated twin request/response topics
    Twin,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Messaging => write!(f, "messaging"),
            ChannelKind::Twin => write!(f, "twin"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messaging" => Ok(Self::Messaging),
            "twin" => Ok(Self::Twin),
            other => Err(format!("unknown channel kind '{other}'")),
        }
    }
}

/// What an inbound message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// A twin envelope for the engine
    Twin,
    /// A plain cloud-to-device message
    Device,
}

/// Topic scheme for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Device identifier
    pub device_id: String,
    /// Topic set in use
    pub kind: ChannelKind,
}

impl TopicScheme {
    /// Create a messaging topic scheme for the given device.
    #[must_use]
    pub fn messaging(device_id: impl Into<String>) -> Self {
        Self::new(device_id, ChannelKind::Messaging)
    }

    /// Create a twin topic scheme for the given device.
    #[must_use]
    pub fn twin(device_id: impl Into<String>) -> Self {
        Self::new(device_id, ChannelKind::Twin)
    }

    /// Create a topic scheme of the given kind.
    #[must_use]
    pub fn new(device_id: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }

    /// Topic outbound messages are published on.
    #[must_use]
    pub fn publish_topic(&self) -> String {
        match self.kind {
            ChannelKind::Messaging => format!("devices/{}/messages/events/", self.device_id),
            ChannelKind::Twin => format!("$iothub/twin/{}/requests/", self.device_id),
        }
    }

    /// Wildcard filter subscribed on start.
    #[must_use]
    pub fn subscribe_filter(&self) -> String {
        format!("{}#", self.parse_prefix())
    }

    /// Prefix every inbound topic for this channel starts with.
    #[must_use]
    pub fn parse_prefix(&self) -> String {
        match self.kind {
            ChannelKind::Messaging => format!("devices/{}/messages/devicebound/", self.device_id),
            ChannelKind::Twin => format!("$iothub/twin/{}/responses/", self.device_id),
        }
    }

    /// Whether a topic strictly extends the parse prefix.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let prefix = self.parse_prefix();
        topic.len() > prefix.len() && topic.starts_with(&prefix)
    }

    /// Classify an inbound message.
    ///
    /// Returns `None` when the topic does not belong to this channel.
    #[must_use]
    pub fn classify(&self, topic: &str, payload: &[u8]) -> Option<MessageClass> {
        if !self.matches(topic) {
            return None;
        }

        match self.kind {
            ChannelKind::Twin => Some(MessageClass::Twin),
            ChannelKind::Messaging => {
                if Envelope::from_cbor(payload).is_ok() {
                    Some(MessageClass::Twin)
                } else {
                    Some(MessageClass::Device)
                }
            }
        }
    }
}
