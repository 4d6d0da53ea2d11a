//! Spoken output: the platform synthesizer seam and the arbiter that keeps it
//! from overlapping with recognition

mod arbiter;

pub use arbiter::SpeechArbiter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

/// Platform text-to-speech
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Speak `text`; resolves when playback ends or fails
    async fn speak(&self, text: &str, voice: Option<&str>) -> Result<(), VoiceError>;

    /// Stop everything queued or playing
    fn cancel_all(&self);
}

/// How an utterance competes with one already in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Preempts whatever is playing
    High,
    /// Dropped if something is playing
    Normal,
}
