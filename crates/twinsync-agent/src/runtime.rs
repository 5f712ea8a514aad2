//! Agent runtime orchestration.

use crate::config::AgentConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use twinsync_core::{CallbackBinding, JsonTwinCodec, Property};
use twinsync_engine::{drain_inbound, StatusHandler, TwinEngine};
use twinsync_proto::TopicScheme;
use twinsync_transport::{drive_eventloop, RumqttTransport, TransportChannel};

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run the agent until ctrl-c or until the broker is lost.
    ///
    /// # Errors
    ///
    /// Returns error if the channel cannot start, an initial twin operation
    /// is rejected, or the connection is lost.
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let scheme = TopicScheme::new(&config.device_id, config.channel);

        let (transport, eventloop) =
            RumqttTransport::new(&config.mqtt).context("Failed to create MQTT transport")?;
        let (channel, mut inbound) = TransportChannel::new(transport, scheme, config.queue_capacity);
        let channel = Arc::new(channel);

        let mut driver = tokio::spawn(drive_eventloop(eventloop, Arc::clone(&channel)));

        channel
            .start()
            .await
            .context("Failed to start transport channel")?;

        let (mut engine, sender) = TwinEngine::start(
            JsonTwinCodec::new(),
            Arc::clone(&channel),
            status_logger(),
            property_logger("generic"),
            config.queue_capacity,
        );

        let bindings: Vec<(Property, CallbackBinding)> = config
            .desired_keys
            .iter()
            .map(|key| (Property::new(key.as_str(), ""), property_logger("bound")))
            .collect();
        engine.subscribe_desired_properties(bindings).await?;
        engine.request_twin().await?;
        if !config.reported.is_empty() {
            engine.update_reported_properties(&config.reported).await?;
        }

        tracing::info!(device_id = %config.device_id, "Agent running, press Ctrl+C to stop");

        let mut outcome = Ok(());
        loop {
            tokio::select! {
                notice = inbound.recv() => {
                    let Some(notice) = notice else { break };
                    tracing::debug!(topic = %notice.topic, "Inbound message pending");
                    match drain_inbound(&channel, &mut engine) {
                        Ok(handled) if handled > 0 => {
                            tracing::debug!(handled, "Dispatched twin messages");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "Failed to drain inbound messages"),
                    }
                }

                finished = &mut driver => {
                    outcome = match finished {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err(anyhow::Error::new(err).context("MQTT connection lost")),
                        Err(err) => Err(anyhow::Error::new(err).context("MQTT driver panicked")),
                    };
                    break;
                }

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        if let Some(twin) = engine.snapshot() {
            tracing::debug!(
                reported = twin.reported.len(),
                desired = twin.desired.len(),
                desired_version = ?twin.desired_version,
                "Final twin snapshot"
            );
        }
        engine.shutdown();
        if let Err(err) = sender.await {
            tracing::warn!(error = %err, "Sender task failed");
        }
        if let Err(err) = channel.stop().await {
            tracing::warn!(error = %err, "Failed to stop transport channel cleanly");
        }

        tracing::info!("Agent stopped");
        outcome
    }
}

fn status_logger() -> StatusHandler {
    StatusHandler::new(
        |status, _| {
            if status.is_success() {
                tracing::info!(%status, "Twin operation status");
            } else {
                tracing::warn!(%status, "Twin operation status");
            }
        },
        None,
    )
}

fn property_logger(route: &'static str) -> CallbackBinding {
    CallbackBinding::without_context(move |key, value, _| {
        tracing::info!(route, key, value, "Desired property changed");
    })
}
