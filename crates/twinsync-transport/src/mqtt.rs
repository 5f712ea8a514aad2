//! `rumqttc`-backed transport and event-loop driver.

use crate::channel::{ChannelError, MqttTransport, TransportChannel, TransportError};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Configuration for the `rumqttc` transport.
#[derive(Debug, Clone)]
pub struct RumqttConfig {
    /// MQTT broker URL (e.g., <tcp://localhost:1883>)
    pub mqtt_broker: String,
    /// Client ID for MQTT connection
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// How long `connect` waits for the broker's CONNACK
    pub connect_timeout: Duration,
    /// Pause between reconnect attempts
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts before the connection is declared lost
    pub max_reconnect_attempts: u32,
}

impl Default for RumqttConfig {
    fn default() -> Self {
        Self {
            mqtt_broker: "tcp://localhost:1883".to_string(),
            client_id: "twinsync-device".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

/// MQTT session over `rumqttc`.
///
/// The session itself is driven by [`drive_eventloop`], which must be running
/// for `connect` to complete.
pub struct RumqttTransport {
    client: AsyncClient,
    connected: watch::Sender<bool>,
    subscriptions: Mutex<Vec<String>>,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
}

impl RumqttTransport {
    /// Create a new transport.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(config: &RumqttConfig) -> Result<(Self, EventLoop), TransportError> {
        let (host, port) = parse_mqtt_url(&config.mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(config.keep_alive);
        // Keep broker-side subscriptions across reconnects.
        mqtt_options.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let (connected, _) = watch::channel(false);

        Ok((
            Self {
                client,
                connected,
                subscriptions: Mutex::new(Vec::new()),
                connect_timeout: config.connect_timeout,
                reconnect_delay: config.reconnect_delay,
                max_reconnect_attempts: config.max_reconnect_attempts,
            },
            eventloop,
        ))
    }

    /// Record the broker connection state observed by the driver.
    pub fn mark_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    /// Whether the broker session is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Filters subscribed since the last reset.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MqttTransport for RumqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut connected = self.connected.subscribe();
        let established = async move {
            loop {
                if *connected.borrow_and_update() {
                    return Ok(());
                }
                if connected.changed().await.is_err() {
                    return Err(());
                }
            }
        };

        match tokio::time::timeout(self.connect_timeout, established).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(())) => Err(TransportError::Connect(
                "connection monitor dropped".to_string(),
            )),
            Err(_) => Err(TransportError::Connect(format!(
                "no CONNACK within {:?}",
                self.connect_timeout
            ))),
        }
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        tracing::info!(filter, "Subscribing to device topics");

        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(filter.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))
    }

    fn reset(&self) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.connected.send_replace(false);
    }
}

/// Poll the `rumqttc` event loop and feed the channel.
///
/// - inbound publishes go to [`TransportChannel::deliver`]
/// - the first error after a successful connect starts a reconnect, pausing
///   the channel until the next CONNACK
/// - after the configured number of consecutive failures the reconnect is
///   reported as failed and the driver stops
///
/// Pausing waits for the channel gate in a separate task, so the event loop
/// keeps being polled while a gate holder (a `start` waiting for CONNACK or a
/// `send` blocked on a full request queue) finishes.
///
/// Returns `Ok` once the client disconnects.
///
/// # Errors
///
/// Returns `ConnectionLost` when the broker cannot be reached again.
pub async fn drive_eventloop(
    mut eventloop: EventLoop,
    channel: Arc<TransportChannel<RumqttTransport>>,
) -> Result<(), ChannelError> {
    let transport = channel.transport();
    let max_attempts = transport.max_reconnect_attempts.max(1);
    let mut connected_once = false;
    let mut pause: Option<PauseTask> = None;
    let mut failures = 0_u32;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                channel.deliver(publish.topic, publish.payload.to_vec());
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("Connected to MQTT broker");
                failures = 0;
                connected_once = true;
                transport.mark_connected(true);
                if let Some(pause) = pause.take() {
                    resume_channel(&channel, pause, true);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::info!("Subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                tracing::debug!(pkid = ack.pkid, "Publish acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("Disconnected from MQTT broker");
                transport.mark_connected(false);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, attempt = failures + 1, "MQTT error");
                transport.mark_connected(false);

                if connected_once && pause.is_none() {
                    pause = Some(pause_channel(&channel));
                }

                failures += 1;
                if failures >= max_attempts {
                    if let Some(pause) = pause.take() {
                        // Gate holders blocked on the request queue fail once
                        // the event loop is dropped, so the pause still lands.
                        resume_channel(&channel, pause, false);
                    }
                    return Err(ChannelError::ConnectionLost(format!(
                        "broker unreachable after {failures} attempts"
                    )));
                }

                tokio::time::sleep(transport.reconnect_delay).await;
            }
        }
    }
}

type PauseTask = JoinHandle<Result<(), ChannelError>>;

fn pause_channel<T: MqttTransport>(channel: &Arc<TransportChannel<T>>) -> PauseTask {
    let channel = Arc::clone(channel);
    tokio::spawn(async move { channel.on_reconnect_begin().await })
}

/// Complete a reconnect once its pause has taken the gate.
fn resume_channel<T: MqttTransport>(
    channel: &Arc<TransportChannel<T>>,
    pause: PauseTask,
    success: bool,
) -> JoinHandle<Result<(), ChannelError>> {
    let channel = Arc::clone(channel);
    tokio::spawn(async move {
        match pause.await {
            Ok(paused) => paused?,
            Err(err) => tracing::warn!(error = %err, "Reconnect pause task failed"),
        }
        let resumed = channel.on_reconnect_complete(success).await;
        if let Err(err) = &resumed {
            tracing::warn!(error = %err, "Reconnect failed, device messaging stopped");
        }
        resumed
    })
}

/// Split a broker address into host and port.
///
/// Accepts `tcp://` and `mqtt://` URLs as well as a bare `host[:port]`; the
/// port defaults to 1883.
///
/// # Errors
///
/// Returns error if the scheme is unsupported or the host/port is malformed.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl(format!("{input}: {reason}"));

    let address = if input.contains("://") {
        input.to_string()
    } else {
        format!("tcp://{input}")
    };
    let url = Url::parse(&address).map_err(|e| invalid(e.to_string()))?;

    if !matches!(url.scheme(), "tcp" | "mqtt") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| invalid("missing host".to_string()))?;

    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_MQTT_PORT)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SessionState;
    use twinsync_proto::TopicScheme;

    #[test]
    fn parse_mqtt_url_tcp() {
        let (host, port) = parse_mqtt_url("tcp://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_mqtt_url_default_port() {
        let (host, port) = parse_mqtt_url("mqtt://hub.example.com").unwrap();
        assert_eq!(host, "hub.example.com");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_mqtt_url_no_scheme() {
        let (host, port) = parse_mqtt_url("broker:8883").unwrap();
        assert_eq!(host, "broker");
        assert_eq!(port, 8883);
    }

    #[test]
    fn parse_mqtt_url_rejects_other_schemes() {
        assert!(matches!(
            parse_mqtt_url("http://broker:1883"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(parse_mqtt_url("broker:1:2").is_err());
        assert!(parse_mqtt_url(":1883").is_err());
    }

    #[test]
    fn parse_mqtt_url_rejects_unparseable_ports() {
        assert!(matches!(
            parse_mqtt_url("tcp://broker:99999"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(parse_mqtt_url("broker:port").is_err());
        assert!(parse_mqtt_url("").is_err());
    }

    #[tokio::test]
    async fn pause_waits_for_gate_without_blocking_the_driver() {
        let config = RumqttConfig {
            connect_timeout: Duration::from_secs(5),
            ..RumqttConfig::default()
        };
        let (transport, _eventloop) = RumqttTransport::new(&config).unwrap();
        let (channel, _inbound) = TransportChannel::new(transport, TopicScheme::messaging("d1"), 4);
        let channel = Arc::new(channel);

        // `start` holds the gate until CONNACK is observed.
        let starting = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.start().await })
        };
        tokio::task::yield_now().await;
        assert!(!channel.is_idle());

        let pause = pause_channel(&channel);
        tokio::task::yield_now().await;
        assert!(!pause.is_finished());

        channel.transport().mark_connected(true);
        starting.await.unwrap().unwrap();

        resume_channel(&channel, pause, true).await.unwrap().unwrap();
        assert!(channel.is_idle());
        assert_eq!(channel.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn failed_resume_reports_connection_lost() {
        let (transport, _eventloop) = RumqttTransport::new(&RumqttConfig::default()).unwrap();
        let (channel, _inbound) = TransportChannel::new(transport, TopicScheme::messaging("d1"), 4);
        let channel = Arc::new(channel);

        let pause = pause_channel(&channel);
        let resumed = resume_channel(&channel, pause, false).await.unwrap();

        assert!(matches!(resumed, Err(ChannelError::ConnectionLost(_))));
        assert!(channel.is_idle());
        assert_eq!(channel.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn reset_forgets_session_customization() {
        let (transport, _eventloop) = RumqttTransport::new(&RumqttConfig::default()).unwrap();
        transport.mark_connected(true);
        transport
            .subscriptions
            .lock()
            .unwrap()
            .push("devices/d/messages/devicebound/#".to_string());

        transport.reset();

        assert!(!transport.is_connected());
        assert!(transport.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn connect_times_out_without_connack() {
        let config = RumqttConfig {
            connect_timeout: Duration::from_millis(20),
            ..RumqttConfig::default()
        };
        let (transport, _eventloop) = RumqttTransport::new(&config).unwrap();

        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn connect_completes_once_marked() {
        let (transport, _eventloop) = RumqttTransport::new(&RumqttConfig::default()).unwrap();
        transport.mark_connected(true);

        assert!(transport.connect().await.is_ok());
    }
}
