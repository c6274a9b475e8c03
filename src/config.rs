//! Configuration management for the chime client
//!
//! Settings load from a TOML file (`~/.config/chime/config.toml` on Linux
//! by default), with every field defaulted so a missing file yields a
//! working local setup. The loaded path is retained so runtime changes,
//! like disabling a broken wake-word detector, can be written back.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which session transport to use
    pub transport: TransportKind,

    /// WebSocket endpoint and device identity
    pub network: NetworkConfig,

    /// MQTT broker settings, used when `transport = "mqtt"`
    pub mqtt: MqttConfig,

    /// Wake-word detection settings
    pub wake_word: WakeWordConfig,

    /// Audio pipeline tunables
    pub audio: AudioTuning,

    /// Where this configuration was loaded from, for write-back
    #[serde(skip)]
    path: Option<PathBuf>,
}

/// Session transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent WebSocket connection
    #[default]
    Websocket,
    /// MQTT pub/sub via a broker
    Mqtt,
}

/// WebSocket endpoint and device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server WebSocket URL
    pub websocket_url: String,

    /// Bearer token sent in the `Authorization` header
    pub access_token: Option<String>,

    /// Stable device identifier, typically a MAC address
    pub device_id: String,

    /// Per-installation client identifier
    pub client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            websocket_url: "ws://localhost:8000/ws".to_string(),
            access_token: None,
            device_id: "00:00:00:00:00:00".to_string(),
            client_id: "chime-client".to_string(),
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker hostname
    pub host: String,

    /// Broker port
    pub port: u16,

    /// MQTT client identifier
    pub client_id: String,

    /// Optional broker credentials
    pub username: Option<String>,

    /// Optional broker credentials
    pub password: Option<String>,

    /// Topic prefix; the client publishes to `<prefix>/out/*` and
    /// subscribes to `<prefix>/in/*`
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "chime-client".to_string(),
            username: None,
            password: None,
            topic_prefix: "chime".to_string(),
        }
    }
}

/// Wake-word detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    /// Enable the wake-word detector; set to false automatically if the
    /// detector fails to start
    pub enabled: bool,

    /// Phrases that trigger the assistant
    pub wake_words: Vec<String>,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wake_words: vec!["hey chime".to_string()],
        }
    }
}

/// Audio pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioTuning {
    /// Poll interval while waiting for the playback queue to drain, ms
    pub drain_poll_ms: u64,

    /// Maximum drain polls before giving up on a graceful finish
    pub drain_max_attempts: u32,

    /// Settle delay after the queue empties, before leaving speaking, ms
    pub drain_grace_ms: u64,

    /// Pause applied to the wake-word detector around an abort, ms
    pub abort_detector_pause_ms: u64,

    /// Tear down and reopen the capture stream on every listen start.
    /// Works around capture devices that go silent after suspend.
    pub force_input_reinit: bool,
}

impl Default for AudioTuning {
    fn default() -> Self {
        Self {
            drain_poll_ms: 100,
            drain_max_attempts: 30,
            drain_grace_ms: 500,
            abort_detector_pause_ms: 100,
            force_input_reinit: cfg!(target_os = "linux"),
        }
    }
}

/// Return the default configuration file path
///
/// Uses `~/.config/chime/config.toml` on Linux
#[must_use]
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "chime", "chime").map_or_else(
        || PathBuf::from("chime.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

impl Config {
    /// Load configuration from the given path, or the default location.
    ///
    /// A missing file is not an error; defaults apply and the resolved
    /// path is kept for later write-back.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
            tracing::info!(path = %path.display(), "loaded configuration");
            config
        } else {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            Self::default()
        };

        config.path = Some(path);
        Ok(config)
    }

    /// Persist a wake-word disable so a failing detector stays off across
    /// restarts
    pub fn persist_wake_word_disabled(&mut self) {
        self.wake_word.enabled = false;

        let Some(path) = self.path.clone() else {
            tracing::warn!("no config path known, wake-word disable not persisted");
            return;
        };

        if let Err(e) = self.write_to(&path) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to persist wake-word disable"
            );
        } else {
            tracing::info!(path = %path.display(), "wake word disabled in configuration");
        }
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
