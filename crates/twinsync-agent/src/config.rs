//! Agent configuration.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use twinsync_core::Property;
use twinsync_proto::ChannelKind;
use twinsync_transport::RumqttConfig;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Device identity used in topics
    pub device_id: String,

    /// Topic set for the device channel
    pub channel: ChannelKind,

    /// MQTT session configuration
    pub mqtt: RumqttConfig,

    /// Reported properties pushed at startup
    pub reported: Vec<Property>,

    /// Desired keys with a dedicated callback
    pub desired_keys: Vec<String>,

    /// Capacity of the inbound and outbound queues
    pub queue_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: "twinsync-device".to_string(),
            channel: ChannelKind::Messaging,
            mqtt: RumqttConfig {
                client_id: format!("twinsync-{}", Uuid::new_v4()),
                ..RumqttConfig::default()
            },
            reported: Vec::new(),
            desired_keys: Vec::new(),
            queue_capacity: 64,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TWINSYNC_DEVICE_ID`: Device identifier
    /// - `TWINSYNC_MQTT_BROKER`: MQTT broker URL
    /// - `TWINSYNC_CLIENT_ID`: MQTT client id
    /// - `TWINSYNC_CHANNEL`: "messaging" or "twin"
    /// - `TWINSYNC_KEEP_ALIVE_SECS`: Keep-alive interval in seconds
    /// - `TWINSYNC_MAX_RECONNECT_ATTEMPTS`: Failed attempts before giving up
    /// - `TWINSYNC_REPORTED`: JSON object of reported properties
    /// - `TWINSYNC_DESIRED_KEYS`: JSON array of desired keys to bind
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(device_id) = lookup("TWINSYNC_DEVICE_ID") {
            if device_id.trim().is_empty() {
                bail!("TWINSYNC_DEVICE_ID cannot be empty");
            }
            config.device_id = device_id;
        }

        if let Some(broker) = lookup("TWINSYNC_MQTT_BROKER") {
            config.mqtt.mqtt_broker = broker;
        }

        if let Some(client_id) = lookup("TWINSYNC_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }

        if let Some(kind) = lookup("TWINSYNC_CHANNEL") {
            config.channel = kind
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid TWINSYNC_CHANNEL")?;
        }

        if let Some(secs) = lookup("TWINSYNC_KEEP_ALIVE_SECS") {
            let secs: u64 = secs.parse().context("Invalid TWINSYNC_KEEP_ALIVE_SECS")?;
            config.mqtt.keep_alive = Duration::from_secs(secs);
        }

        if let Some(attempts) = lookup("TWINSYNC_MAX_RECONNECT_ATTEMPTS") {
            config.mqtt.max_reconnect_attempts = attempts
                .parse()
                .context("Invalid TWINSYNC_MAX_RECONNECT_ATTEMPTS")?;
        }

        if let Some(reported_json) = lookup("TWINSYNC_REPORTED") {
            let reported: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&reported_json).context("Invalid TWINSYNC_REPORTED JSON")?;
            config.reported = reported
                .into_iter()
                .map(|(key, value)| Property::new(key, value))
                .collect();
        }

        if let Some(keys_json) = lookup("TWINSYNC_DESIRED_KEYS") {
            config.desired_keys =
                serde_json::from_str(&keys_json).context("Invalid TWINSYNC_DESIRED_KEYS JSON")?;
        }

        Ok(config)
    }
}
