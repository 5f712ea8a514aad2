use std::sync::{Arc, Mutex};
use tokio_test::{assert_pending, assert_ready, task};
use twinsync_proto::TopicScheme;
use twinsync_transport::{
    ChannelError, Message, MqttTransport, SessionState, TransportChannel, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Connect,
    Subscribe(String),
    Publish(String, Vec<u8>),
    Disconnect,
    Reset,
}

#[derive(Default)]
struct RecordingTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    fail_connect: bool,
}

impl RecordingTransport {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn publishes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Publish(..)))
            .count()
    }
}

impl MqttTransport for RecordingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(Call::Connect);
        if self.fail_connect {
            return Err(TransportError::Connect("refused".to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Subscribe(filter.to_string()));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Publish(topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(Call::Disconnect);
        Ok(())
    }

    fn reset(&self) {
        self.calls.lock().unwrap().push(Call::Reset);
    }
}

fn channel(transport: RecordingTransport) -> TransportChannel<RecordingTransport> {
    let (channel, _inbound) = TransportChannel::new(transport, TopicScheme::messaging("dev1"), 8);
    channel
}

#[tokio::test]
async fn start_connects_then_subscribes() {
    let channel = channel(RecordingTransport::default());

    channel.start().await.unwrap();

    assert_eq!(
        channel.transport().calls(),
        vec![
            Call::Connect,
            Call::Subscribe("devices/dev1/messages/devicebound/#".to_string())
        ]
    );
    assert_eq!(channel.state(), SessionState::Connected);
    assert!(channel.is_idle());
}

#[tokio::test]
async fn start_releases_gate_on_failure() {
    let channel = channel(RecordingTransport {
        fail_connect: true,
        ..RecordingTransport::default()
    });

    let result = channel.start().await;

    assert!(matches!(
        result,
        Err(ChannelError::Transport(TransportError::Connect(_)))
    ));
    assert!(channel.is_idle());
    assert_eq!(channel.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn stop_disconnects_resets_and_closes_store() {
    let channel = channel(RecordingTransport::default());
    channel.start().await.unwrap();
    channel.deliver("devices/dev1/messages/devicebound/m1".to_string(), b"x".to_vec());

    channel.stop().await.unwrap();

    let calls = channel.transport().calls();
    assert_eq!(&calls[2..], &[Call::Disconnect, Call::Reset]);
    assert_eq!(channel.state(), SessionState::Disconnected);
    assert!(matches!(
        channel.parse_topic(),
        Err(ChannelError::InvalidState(_))
    ));
    assert!(channel.is_idle());
}

#[tokio::test]
async fn send_publishes_on_event_topic() {
    let channel = channel(RecordingTransport::default());

    channel.send(&Message::new(b"hello".to_vec())).await.unwrap();

    assert_eq!(
        channel.transport().calls(),
        vec![Call::Publish(
            "devices/dev1/messages/events/".to_string(),
            b"hello".to_vec()
        )]
    );
}

#[tokio::test]
async fn send_without_payload_is_rejected() {
    let channel = channel(RecordingTransport::default());

    let result = channel.send(&Message::empty()).await;

    assert!(matches!(result, Err(ChannelError::InvalidArgument(_))));
    assert_eq!(channel.transport().publishes(), 0);
    assert!(channel.is_idle());
}

#[tokio::test]
async fn payload_is_consumed_exactly_once() {
    let channel = channel(RecordingTransport::default());
    channel.deliver("devices/dev1/messages/devicebound/m1".to_string(), b"p".to_vec());

    let topic = channel.parse_topic().unwrap();
    assert_eq!(topic.as_deref(), Some("devices/dev1/messages/devicebound/m1"));

    let payload = channel.parse_payload(topic.as_deref()).unwrap();
    assert_eq!(payload, Some(b"p".to_vec()));

    assert!(matches!(
        channel.parse_payload(topic.as_deref()),
        Err(ChannelError::InvalidState(_))
    ));
}

#[tokio::test]
async fn repeated_topic_yields_every_payload_in_order() {
    let channel = channel(RecordingTransport::default());
    let topic = "devices/dev1/messages/devicebound/twin";
    channel.deliver(topic.to_string(), b"one".to_vec());
    channel.deliver(topic.to_string(), b"two".to_vec());

    assert_eq!(
        channel.next_message().unwrap(),
        Some((topic.to_string(), b"one".to_vec()))
    );
    assert_eq!(
        channel.next_message().unwrap(),
        Some((topic.to_string(), b"two".to_vec()))
    );
    assert_eq!(channel.next_message().unwrap(), None);
    assert!(matches!(
        channel.parse_payload(Some(topic)),
        Err(ChannelError::InvalidState(_))
    ));
}

#[tokio::test]
async fn parse_topic_skips_foreign_and_bare_prefix_topics() {
    let channel = channel(RecordingTransport::default());
    assert_eq!(channel.parse_topic().unwrap(), None);

    channel.deliver("devices/dev1/messages/devicebound/".to_string(), Vec::new());
    channel.deliver("devices/dev2/messages/devicebound/m".to_string(), Vec::new());
    assert_eq!(channel.parse_topic().unwrap(), None);

    channel.deliver("devices/dev1/messages/devicebound/m".to_string(), Vec::new());
    assert_eq!(
        channel.parse_topic().unwrap().as_deref(),
        Some("devices/dev1/messages/devicebound/m")
    );
}

#[tokio::test]
async fn parse_payload_without_topic_touches_nothing() {
    let channel = channel(RecordingTransport::default());
    channel.deliver("devices/dev1/messages/devicebound/m".to_string(), b"k".to_vec());

    assert_eq!(channel.parse_payload(None).unwrap(), None);
    assert!(channel.parse_topic().unwrap().is_some());
}

#[tokio::test]
async fn send_waits_for_reconnect_to_complete() {
    let channel = channel(RecordingTransport::default());
    let message = Message::new(b"queued".to_vec());

    channel.on_reconnect_begin().await.unwrap();
    assert_eq!(channel.state(), SessionState::Reconnecting);

    let mut send = task::spawn(channel.send(&message));
    assert_pending!(send.poll());
    assert_pending!(send.poll());
    assert_eq!(channel.transport().publishes(), 0);

    channel.on_reconnect_complete(true).await.unwrap();

    assert!(send.is_woken());
    let result = assert_ready!(send.poll());
    assert!(result.is_ok());
    assert_eq!(channel.transport().publishes(), 1);
    assert_eq!(channel.state(), SessionState::Connected);
}

#[tokio::test]
async fn failed_reconnect_releases_gate_and_reports_loss() {
    let channel = channel(RecordingTransport::default());

    channel.on_reconnect_begin().await.unwrap();
    assert!(!channel.is_idle());

    let result = channel.on_reconnect_complete(false).await;

    assert!(matches!(result, Err(ChannelError::ConnectionLost(_))));
    assert!(channel.is_idle());
    channel.send(&Message::new(b"after".to_vec())).await.unwrap();
    assert_eq!(channel.transport().publishes(), 1);
}

#[tokio::test]
async fn closed_channel_reports_connection_lost() {
    let channel = channel(RecordingTransport::default());
    channel.close();

    let result = channel.send(&Message::new(b"x".to_vec())).await;

    assert!(matches!(result, Err(ChannelError::ConnectionLost(_))));
}

#[tokio::test]
async fn deliver_wakes_consumer() {
    let (channel, mut inbound) =
        TransportChannel::new(RecordingTransport::default(), TopicScheme::twin("dev1"), 1);

    channel.deliver("$iothub/twin/dev1/responses/1".to_string(), b"a".to_vec());
    channel.deliver("$iothub/twin/dev1/responses/2".to_string(), b"b".to_vec());

    let notice = inbound.recv().await.unwrap();
    assert_eq!(notice.topic, "$iothub/twin/dev1/responses/1");
    assert!(inbound.try_recv().is_err());

    let mut drained = Vec::new();
    while let Some((topic, _)) = channel.next_message().unwrap() {
        drained.push(topic);
    }
    assert_eq!(drained.len(), 2);
}
