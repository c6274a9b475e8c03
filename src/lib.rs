//! Chime - voice assistant client
//!
//! A hands-free client for a conversational AI server: it captures and
//! Opus-encodes microphone audio, streams it over WebSocket or MQTT, and
//! plays back synthesized speech, driven by a four-state device lifecycle
//! (idle, connecting, listening, speaking).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               DeviceController                   │
//! │   state machine │ scheduler │ wake word          │
//! └───────┬─────────────────────────────┬───────────┘
//!         │                             │
//! ┌───────▼───────────┐   ┌─────────────▼───────────┐
//! │   AudioEngine     │   │    SessionProtocol       │
//! │ mic/speaker, Opus │   │  WebSocket  │  MQTT      │
//! └───────────────────┘   └─────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod controller;
pub mod display;
pub mod error;
pub mod iot;
pub mod protocol;
pub mod wake_word;

pub use audio::{AudioEngine, AudioFrame};
pub use config::{Config, TransportKind};
pub use controller::{ControllerHandle, DeviceController, DeviceState, StateObserver};
pub use display::{Display, LogDisplay};
pub use error::{Error, Result};
pub use iot::{IotRegistry, NullRegistry};
pub use protocol::{
    MqttProtocol, ProtocolEvent, ServerEvent, SessionProtocol, WebSocketProtocol,
};
pub use wake_word::{WakeWordDetector, WakeWordEvent};
