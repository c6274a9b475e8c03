//! Device lifecycle states

/// The four lifecycle states of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// Standby; nothing in flight
    #[default]
    Idle,
    /// Opening the audio channel
    Connecting,
    /// Capturing and uploading the user's speech
    Listening,
    /// Playing synthesized speech from the server
    Speaking,
}

impl DeviceState {
    /// Human-readable status line for this state
    #[must_use]
    pub const fn status_text(self) -> &'static str {
        match self {
            Self::Idle => "Standby",
            Self::Connecting => "Connecting...",
            Self::Listening => "Listening...",
            Self::Speaking => "Speaking...",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_idle() {
        assert_eq!(DeviceState::default(), DeviceState::Idle);
        assert_eq!(DeviceState::Idle.status_text(), "Standby");
    }
}
