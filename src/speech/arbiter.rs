//! Serializes speech playback against the recognition session
//!
//! The microphone is closed before playback starts and reopened only after a
//! settling delay once playback is over, so the recognizer never hears the
//! assistant. At most one utterance is in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::recognition::RecognitionSupervisor;
use crate::state::ControllerEvent;
use crate::timer::Timer;

use super::{Priority, Synthesizer};

#[derive(Debug)]
enum Phase {
    Idle,
    Playing { utterance: u64, task: JoinHandle<()> },
    Settling { utterance: u64 },
}

pub struct SpeechArbiter {
    synthesizer: Arc<dyn Synthesizer>,
    voice: Option<String>,
    queue: mpsc::Sender<ControllerEvent>,
    settle: Duration,
    settle_timer: Timer,
    phase: Phase,
    next_utterance: u64,
}

impl SpeechArbiter {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        voice: Option<String>,
        queue: mpsc::Sender<ControllerEvent>,
        settle: Duration,
    ) -> Self {
        Self {
            synthesizer,
            voice,
            queue,
            settle,
            settle_timer: Timer::new(),
            phase: Phase::Idle,
            next_utterance: 0,
        }
    }

    /// An utterance is playing
    pub fn is_speaking(&self) -> bool {
        matches!(self.phase, Phase::Playing { .. })
    }

    /// Playing or still waiting out the settle delay
    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Start speaking `text`, closing the microphone first
    ///
    /// Returns the utterance id, or `None` if nothing was started.
    pub fn speak(
        &mut self,
        text: &str,
        priority: Priority,
        recognition: &mut RecognitionSupervisor,
    ) -> Option<u64> {
        if text.trim().is_empty() {
            return None;
        }

        if self.is_speaking() {
            match priority {
                Priority::Normal => {
                    debug!("normal-priority utterance dropped, another is in flight");
                    return None;
                }
                Priority::High => self.abort_playback(),
            }
        }
        self.settle_timer.cancel();

        recognition.suspend();

        self.next_utterance += 1;
        let utterance = self.next_utterance;
        let synthesizer = Arc::clone(&self.synthesizer);
        let queue = self.queue.clone();
        let text = text.to_string();
        let voice = self.voice.clone();

        debug!(utterance, ?priority, %text, "speaking");
        let task = tokio::spawn(async move {
            let error = synthesizer
                .speak(&text, voice.as_deref())
                .await
                .err()
                .map(|e| e.to_string());
            let _ = queue
                .send(ControllerEvent::PlaybackFinished { utterance, error })
                .await;
        });

        self.phase = Phase::Playing { utterance, task };
        Some(utterance)
    }

    /// Playback of `utterance` ended; starts the settle delay
    ///
    /// Returns false for utterances that were preempted or cancelled.
    pub fn playback_finished(&mut self, utterance: u64, error: Option<&str>) -> bool {
        match self.phase {
            Phase::Playing { utterance: current, .. } if current == utterance => {}
            _ => {
                debug!(utterance, "stale playback completion");
                return false;
            }
        }

        if let Some(error) = error {
            warn!(utterance, error, "speech playback failed");
        }

        self.phase = Phase::Settling { utterance };
        self.settle_timer.arm(
            self.settle,
            &self.queue,
            ControllerEvent::SettleElapsed { utterance },
        );
        true
    }

    /// Settle delay over; reopens the microphone if the controller still
    /// wants it. Returns true when `utterance` is now complete.
    pub fn settled(&mut self, utterance: u64, recognition: &mut RecognitionSupervisor) -> bool {
        match self.phase {
            Phase::Settling { utterance: current } if current == utterance => {
                self.phase = Phase::Idle;
                recognition.resume();
                true
            }
            _ => false,
        }
    }

    /// Halt any utterance and lift the microphone hold. The supervisor
    /// reopens only if the controller still wants to listen.
    pub fn cancel(&mut self, recognition: &mut RecognitionSupervisor) -> bool {
        let was_busy = self.is_busy();
        self.abort_playback();
        self.settle_timer.cancel();
        self.phase = Phase::Idle;
        recognition.resume();
        was_busy
    }

    fn abort_playback(&mut self) {
        if let Phase::Playing { utterance, task } = std::mem::replace(&mut self.phase, Phase::Idle) {
            task.abort();
            self.synthesizer.cancel_all();
            debug!(utterance, "utterance cancelled");
        }
    }
}
