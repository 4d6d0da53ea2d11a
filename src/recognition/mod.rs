//! Speech recognition: the platform recognizer seam and the supervisor that
//! keeps one continuous session alive
//!
//! Raw recognizer callbacks arrive as [`RecognizerSignal`]s on the controller
//! queue; the supervisor filters and classifies them into
//! [`RecognitionEvent`]s, the only form the controller consumes.

mod supervisor;

pub use supervisor::RecognitionSupervisor;

use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

/// Options for a recognition session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizerOptions {
    pub continuous: bool,
    pub language: String,
}

/// Platform speech recognizer
///
/// `start` and `stop` only request a change; the outcome is reported later
/// through `Started`/`Ended` signals. Every successful `start` is followed by
/// exactly one `Ended`.
pub trait Recognizer: Send + Sync {
    fn start(&self, options: &RecognizerOptions) -> Result<(), VoiceError>;
    fn stop(&self);
}

/// Callback from the platform recognizer, as delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerSignal {
    Started,
    /// Cumulative transcript fragments of the current utterance
    Result { fragments: Vec<String>, is_final: bool },
    Ended { reason: String },
    Error { code: String },
}

/// Classified recognition failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionErrorKind {
    PermissionDenied,
    NoSpeechTimeout,
    NetworkError,
    Other,
}

impl RecognitionErrorKind {
    /// Map a platform error code (Web Speech API spelling) to a kind
    pub fn from_code(code: &str) -> Self {
        match code {
            "not-allowed" | "service-not-allowed" | "permission-denied" => Self::PermissionDenied,
            "no-speech" => Self::NoSpeechTimeout,
            "network" => Self::NetworkError,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for RecognitionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecognitionErrorKind::PermissionDenied => write!(f, "permission denied"),
            RecognitionErrorKind::NoSpeechTimeout => write!(f, "no speech detected"),
            RecognitionErrorKind::NetworkError => write!(f, "network error"),
            RecognitionErrorKind::Other => write!(f, "recognition error"),
        }
    }
}

/// Event consumed by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    InterimTranscript { text: String },
    FinalTranscript { text: String },
    SessionStarted,
    SessionEnded { reason: String },
    RecognitionError { kind: RecognitionErrorKind },
}
