//! # Twin-Sync Agent
//!
//! Device-side runtime that keeps a device twin in sync over MQTT.
//!
//! ## Architecture
//!
//! The agent runs three concurrent loops:
//! 1. **Driver**: Polls the MQTT event loop, stores inbound publishes and
//!    gates sends while the session reconnects
//! 2. **Sender**: Publishes queued twin requests and reports their status
//! 3. **Dispatch**: Drains stored messages and hands twin envelopes to the
//!    engine, which fires desired-property callbacks

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Twin-Sync Agent"
    );

    // Load configuration
    let config = AgentConfig::from_env()?;

    tracing::info!(
        device_id = %config.device_id,
        channel = %config.channel,
        broker = %config.mqtt.mqtt_broker,
        "Agent initialized"
    );

    // Run agent
    Agent::new(config).run().await?;

    Ok(())
}
