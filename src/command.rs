//! Command capture while the assistant is active
//!
//! Recognizer transcripts are cumulative per utterance, so the buffer keeps
//! only the latest one. Each transcript re-arms the silence timer; when the
//! timer fires the buffered text becomes the command.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::state::ControllerEvent;
use crate::timer::Timer;
use crate::wake::PhraseSet;

/// What a transcript did to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Text buffered, silence timer re-armed
    Buffered,
    /// Final transcript asked the assistant to go back to sleep
    Deactivate,
}

pub struct CommandBuffer {
    text: String,
    /// Bumped on every arm and every clear; stale timer events carry an older value
    generation: u64,
    timer: Timer,
    silence: Duration,
    deactivation: PhraseSet,
    queue: mpsc::Sender<ControllerEvent>,
}

impl CommandBuffer {
    pub fn new(
        silence: Duration,
        deactivation: PhraseSet,
        queue: mpsc::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            text: String::new(),
            generation: 0,
            timer: Timer::new(),
            silence,
            deactivation,
            queue,
        }
    }

    /// Buffered text of the current episode
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Discard text and any pending finalize
    pub fn clear(&mut self) {
        self.text.clear();
        self.generation += 1;
        self.timer.cancel();
    }

    pub fn ingest(&mut self, transcript: &str, is_final: bool) -> Ingest {
        if is_final {
            if let Some(phrase) = self.deactivation.find(transcript) {
                debug!(phrase, "deactivation phrase heard");
                self.clear();
                return Ingest::Deactivate;
            }
        }

        self.text.clear();
        self.text.push_str(transcript);
        self.generation += 1;
        self.timer.arm(
            self.silence,
            &self.queue,
            ControllerEvent::SilenceElapsed {
                generation: self.generation,
            },
        );
        trace!(generation = self.generation, is_final, "command buffer updated");
        Ingest::Buffered
    }

    /// Silence timer fired; yields the command once
    pub fn finalize(&mut self, generation: u64) -> Option<String> {
        if generation != self.generation {
            trace!(generation, current = self.generation, "stale silence timer");
            return None;
        }

        self.generation += 1;
        self.timer.cancel();
        let text = std::mem::take(&mut self.text);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(text.to_string())
    }
}
