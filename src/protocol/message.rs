//! Wire message model: decoded inbound events and outbound envelopes
//!
//! Inbound JSON is decoded once into [`ServerEvent`] and matched
//! exhaustively; outbound messages are fixed envelopes carrying a `type`
//! discriminator.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audio::{CHANNELS, FRAME_DURATION_MS, INPUT_SAMPLE_RATE};
use crate::{Error, Result};

/// Protocol version declared in the client hello
pub const PROTOCOL_VERSION: u32 = 1;

/// Server-side end-of-utterance detection policy, carried in the
/// "start listening" message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListeningMode {
    /// Client decides when the utterance ends
    Manual,
    /// Server stops listening when it detects end of speech
    #[serde(rename = "auto")]
    AutoStop,
    /// Continuous listening driven by wake words
    #[serde(rename = "realtime")]
    WakeWord,
}

/// Why an in-progress speech/listen cycle was cut short
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortReason {
    /// User-initiated abort
    #[default]
    None,
    /// A wake word interrupted playback
    WakeWordDetected,
}

/// Audio parameters declared in the hello handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    /// Codec name; always "opus"
    pub format: String,
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// Frame duration in milliseconds
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: INPUT_SAMPLE_RATE,
            channels: CHANNELS,
            frame_duration: FRAME_DURATION_MS,
        }
    }
}

/// Server hello acknowledgment
#[derive(Debug, Clone, Deserialize)]
pub struct ServerHello {
    /// Must match the transport that sent the client hello
    pub transport: String,
    /// Session identifier, when the server assigns one
    #[serde(default)]
    pub session_id: Option<String>,
    /// Server-side audio parameters
    #[serde(default)]
    pub audio_params: Option<AudioParams>,
}

/// TTS lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    /// Synthesized speech is about to stream
    Start,
    /// The speech stream has ended
    Stop,
    /// A new sentence begins; `text` carries its transcript
    SentenceStart,
}

/// TTS event payload
#[derive(Debug, Clone, Deserialize)]
pub struct TtsEvent {
    /// Lifecycle phase
    pub state: TtsState,
    /// Sentence transcript, present on `sentence_start`
    #[serde(default)]
    pub text: Option<String>,
}

/// An inbound structured message, decoded once and dispatched by variant
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    /// Handshake acknowledgment; consumed by the transport
    Hello(ServerHello),
    /// Text-to-speech lifecycle
    Tts(TtsEvent),
    /// Speech-to-text transcript of the user utterance
    Stt {
        /// Recognized text
        #[serde(default)]
        text: String,
    },
    /// Assistant affect update
    Llm {
        /// Emotion tag, e.g. "happy"
        #[serde(default)]
        emotion: Option<String>,
    },
    /// IoT command batch
    Iot {
        /// Commands to forward to the registry, executed independently
        #[serde(default)]
        commands: Vec<Value>,
    },
    /// Any type this client does not understand
    #[serde(other)]
    Unknown,
}

/// Decode one inbound text payload
///
/// # Errors
///
/// Returns error on malformed JSON; the caller logs and drops the message
pub fn parse_server_event(raw: &str) -> Result<ServerEvent> {
    serde_json::from_str(raw).map_err(Error::from)
}

/// Client hello declaring protocol version, transport kind, and audio
/// parameters
#[must_use]
pub fn client_hello(transport: &str) -> Value {
    json!({
        "type": "hello",
        "version": PROTOCOL_VERSION,
        "transport": transport,
        "audio_params": AudioParams::default(),
    })
}

/// "Start listening" envelope
#[must_use]
pub fn start_listening(mode: ListeningMode) -> Value {
    json!({
        "session_id": "",
        "type": "listen",
        "state": "start",
        "mode": mode,
    })
}

/// "Stop listening" envelope
#[must_use]
pub fn stop_listening() -> Value {
    json!({
        "session_id": "",
        "type": "listen",
        "state": "stop",
    })
}

/// "Abort speaking" envelope; the reason is carried only for wake-word
/// interrupts
#[must_use]
pub fn abort_speaking(reason: AbortReason) -> Value {
    match reason {
        AbortReason::WakeWordDetected => json!({
            "session_id": "",
            "type": "abort",
            "reason": "wake_word_detected",
        }),
        AbortReason::None => json!({
            "session_id": "",
            "type": "abort",
        }),
    }
}

/// "Wake word detected" envelope carrying the recognized phrase
#[must_use]
pub fn wake_word_detected(text: &str) -> Value {
    json!({
        "session_id": "",
        "type": "listen",
        "state": "detect",
        "text": text,
    })
}

/// IoT descriptor announcement, sent once per channel open
#[must_use]
pub fn iot_descriptors(descriptors: Value) -> Value {
    json!({
        "session_id": "",
        "type": "iot",
        "descriptors": descriptors,
    })
}

/// IoT state snapshot
#[must_use]
pub fn iot_states(states: Value) -> Value {
    json!({
        "session_id": "",
        "type": "iot",
        "states": states,
    })
}
