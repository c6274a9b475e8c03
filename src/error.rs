//! Error types for the Chime client

use thiserror::Error;

/// Result type alias for Chime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Chime client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio hardware error
    #[error("audio error: {0}")]
    Audio(String),

    /// Opus encode/decode error
    #[error("codec error: {0}")]
    Codec(String),

    /// Session transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Controller lifecycle error
    #[error("controller error: {0}")]
    Controller(String),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// IoT command error
    #[error("iot error: {0}")]
    Iot(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
