//! Error types shared by the voice pipeline

use std::time::Duration;

use thiserror::Error;

/// Failures reported by the platform capabilities (recognizer, synthesizer,
/// permission prompt) or by the bridge that carries them
#[derive(Debug, Error)]
pub enum VoiceError {
    /// No platform client is registered to carry the request
    #[error("no platform client is connected")]
    PlatformUnavailable,

    /// Speech playback failed
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    /// Playback was cancelled before it finished
    #[error("speech was cancelled")]
    Cancelled,

    /// The controller queue is gone
    #[error("controller is not running")]
    ControllerStopped,
}

/// Failures of the remote interpretation call or of the action it produced
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Request never completed (connection refused, reset, DNS)
    #[error("transport error: {0}")]
    Transport(String),

    /// Service answered with a non-success status
    #[error("service returned HTTP {0}")]
    Status(u16),

    /// Response body could not be decoded
    #[error("malformed response: {0}")]
    Malformed(String),

    /// No answer within the dispatch deadline
    #[error("no response after {0:?}")]
    Timeout(Duration),

    /// Action sink rejected the call description
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
