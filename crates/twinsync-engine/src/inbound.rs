//! Hands messages received by the channel to the engine.

use crate::engine::{TwinEngine, TwinError};
use twinsync_core::TwinCodec;
use twinsync_proto::MessageClass;
use twinsync_transport::{MqttTransport, TransportChannel};

/// Drain every pending message for the channel.
///
/// Twin envelopes are dispatched to the engine; other device messages are
/// consumed and logged. Returns the number of twin envelopes handled.
///
/// # Errors
///
/// Returns `InvalidState` if the channel's store is not initialized.
pub fn drain_inbound<T, C>(
    channel: &TransportChannel<T>,
    engine: &mut TwinEngine<C>,
) -> Result<usize, TwinError>
where
    T: MqttTransport,
    C: TwinCodec,
{
    let mut handled = 0;

    while let Some((topic, payload)) = channel.next_message()? {
        match channel.scheme().classify(&topic, &payload) {
            Some(MessageClass::Twin) => {
                if let Err(err) = engine.handle_payload(&payload) {
                    tracing::warn!(error = %err, topic, "Dropping malformed twin message");
                    continue;
                }
                handled += 1;
            }
            Some(MessageClass::Device) => {
                tracing::info!(topic, payload_len = payload.len(), "Received device message");
            }
            None => {
                tracing::debug!(topic, "Ignoring message for another channel");
            }
        }
    }

    Ok(handled)
}
