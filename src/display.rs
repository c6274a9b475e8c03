//! User-facing status surface
//!
//! The controller narrates its lifecycle through this trait: device
//! status, recognized and spoken text, and the assistant's emotion tag.
//! The default implementation writes structured log lines; a graphical
//! frontend would implement the same trait.

/// Receives controller status updates
pub trait Display: Send {
    /// The device moved to a new status, e.g. "Listening..."
    fn set_status(&self, status: &str);

    /// A transcript or spoken sentence to show
    fn show_text(&self, text: &str);

    /// The assistant's emotion tag, e.g. "happy"
    fn set_emotion(&self, emotion: &str);

    /// A network or device problem worth surfacing
    fn show_error(&self, message: &str);

    /// A 6+-digit activation code found in spoken text, for the frontend
    /// to present or forward (e.g. open the activation page)
    fn show_verification_code(&self, code: &str);
}

/// Logs status updates via tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl Display for LogDisplay {
    fn set_status(&self, status: &str) {
        tracing::info!(status, "device status");
    }

    fn show_text(&self, text: &str) {
        tracing::info!(text, "conversation");
    }

    fn set_emotion(&self, emotion: &str) {
        tracing::debug!(emotion, "emotion");
    }

    fn show_error(&self, message: &str) {
        tracing::error!(message, "device error");
    }

    fn show_verification_code(&self, code: &str) {
        tracing::info!(code, "verification code received");
    }
}
