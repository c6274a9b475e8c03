//! Session protocol: transport-agnostic message contract
//!
//! Two backends implement [`SessionProtocol`]: a persistent WebSocket
//! transport and an MQTT pub/sub transport. Both deliver inbound traffic
//! to the controller over a single [`ProtocolEvent`] channel handed to the
//! transport at construction, so no event can fire into an unset slot.

pub mod message;
mod mqtt;
mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use message::{
    AbortReason, AudioParams, ListeningMode, ServerEvent, ServerHello, TtsEvent, TtsState,
};
pub use mqtt::MqttProtocol;
pub use websocket::WebSocketProtocol;

use crate::audio::AudioFrame;

/// How long to wait for the server hello acknowledgment
pub const HELLO_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Inbound traffic and lifecycle notifications delivered to the controller
#[derive(Debug)]
pub enum ProtocolEvent {
    /// A transport failure; always drives the state machine back to idle
    NetworkError(String),
    /// One encoded audio frame from the server
    IncomingAudio(AudioFrame),
    /// A decoded structured message (hello is consumed by the transport
    /// and never appears here)
    Incoming(ServerEvent),
    /// The handshake completed and the audio channel is open
    AudioChannelOpened,
    /// The transport closed, expectedly or not
    AudioChannelClosed,
}

/// Sender half of the protocol event channel
pub type EventSender = mpsc::UnboundedSender<ProtocolEvent>;

/// Receiver half of the protocol event channel
pub type EventReceiver = mpsc::UnboundedReceiver<ProtocolEvent>;

/// Reliable message transport with audio-channel lifecycle.
///
/// Transport failures are reported through the event channel, never
/// raised past this boundary; the boolean returns carry only
/// success/failure of the operation itself.
#[async_trait]
pub trait SessionProtocol: Send {
    /// Establish the transport and perform the hello handshake.
    ///
    /// Returns false on timeout or transport error, after emitting a
    /// network-error event with a descriptive reason.
    async fn connect(&mut self) -> bool;

    /// True only between a successful handshake and a close
    fn is_audio_channel_opened(&self) -> bool;

    /// Open the audio channel, connecting first if necessary; idempotent
    async fn open_audio_channel(&mut self) -> bool {
        if self.is_audio_channel_opened() {
            return true;
        }
        self.connect().await
    }

    /// Close the transport and mark the channel closed; idempotent
    async fn close_audio_channel(&mut self);

    /// Send one encoded audio frame; no-op while the channel is closed
    async fn send_audio(&mut self, frame: AudioFrame);

    /// Send a serialized text message
    async fn send_text(&mut self, text: String);

    /// Announce that listening has started in the given mode
    async fn send_start_listening(&mut self, mode: ListeningMode) {
        self.send_text(message::start_listening(mode).to_string())
            .await;
    }

    /// Announce that listening has stopped
    async fn send_stop_listening(&mut self) {
        self.send_text(message::stop_listening().to_string()).await;
    }

    /// Ask the server to cancel in-flight speech
    async fn send_abort_speaking(&mut self, reason: AbortReason) {
        self.send_text(message::abort_speaking(reason).to_string())
            .await;
    }

    /// Report a detected wake word
    async fn send_wake_word_detected(&mut self, text: &str) {
        self.send_text(message::wake_word_detected(text).to_string())
            .await;
    }

    /// Publish the IoT descriptor set
    async fn send_iot_descriptors(&mut self, descriptors: serde_json::Value) {
        self.send_text(message::iot_descriptors(descriptors).to_string())
            .await;
    }

    /// Publish an IoT state snapshot
    async fn send_iot_states(&mut self, states: serde_json::Value) {
        self.send_text(message::iot_states(states).to_string())
            .await;
    }
}

/// Create the protocol event channel shared by a transport and the
/// controller
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
