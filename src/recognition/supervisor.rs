//! Lifecycle of the continuous recognition session
//!
//! The supervisor is owned by the controller and only touched from its event
//! loop. Three inputs decide whether the microphone should be open:
//! the controller's intent, the speech arbiter's suspension, and permission.
//! Natural session ends are restarted after a debounce delay that backs off
//! while starts keep failing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::permission::PermissionState;
use crate::state::ControllerEvent;
use crate::timer::Timer;

use super::{
    RecognitionErrorKind, RecognitionEvent, Recognizer, RecognizerOptions, RecognizerSignal,
};

pub struct RecognitionSupervisor {
    recognizer: Arc<dyn Recognizer>,
    options: RecognizerOptions,
    queue: mpsc::Sender<ControllerEvent>,
    permission: PermissionState,
    /// Controller wants the microphone open; cleared before any stop it causes
    intent: bool,
    /// Held closed while the assistant speaks
    suspended: bool,
    /// A session was requested and has not been stopped or ended since
    requested: bool,
    /// Successful starts whose `Ended` has not arrived yet
    outstanding: u32,
    restart_timer: Timer,
    restart_generation: u64,
    restart_delay: Duration,
    backoff_max: Duration,
    failed_starts: u32,
}

impl RecognitionSupervisor {
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        options: RecognizerOptions,
        queue: mpsc::Sender<ControllerEvent>,
        restart_delay: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            recognizer,
            options,
            queue,
            permission: PermissionState::Unknown,
            intent: false,
            suspended: false,
            requested: false,
            outstanding: 0,
            restart_timer: Timer::new(),
            restart_generation: 0,
            restart_delay,
            backoff_max,
            failed_starts: 0,
        }
    }

    /// Whether transcripts from the recognizer are currently accepted
    #[cfg(test)]
    pub fn is_listening(&self) -> bool {
        self.requested
    }

    pub fn wants_to_listen(&self) -> bool {
        self.intent
    }

    pub fn set_permission(&mut self, permission: PermissionState) {
        self.permission = permission;
        if !permission.is_granted() {
            self.restart_timer.cancel();
            self.stop();
        }
    }

    /// Declare intent to listen and open a session if nothing prevents it
    pub fn enable(&mut self) {
        self.intent = true;
        self.start();
    }

    /// Drop intent, then stop; no restart can follow
    pub fn disable(&mut self) {
        self.intent = false;
        self.restart_timer.cancel();
        self.stop();
    }

    /// Close the microphone while the assistant speaks
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.restart_timer.cancel();
        self.stop();
    }

    /// Lift the speech hold; reopens only if intent is still set
    pub fn resume(&mut self) {
        self.suspended = false;
        if self.intent {
            self.start();
        }
    }

    fn may_listen(&self) -> bool {
        self.intent && !self.suspended && self.permission.is_granted()
    }

    /// Request a session. Idempotent: a no-op while one is requested.
    pub fn start(&mut self) -> bool {
        if !self.may_listen() || self.requested {
            return false;
        }

        if self.outstanding > 0 {
            // previous session still winding down; its Ended restarts us
            trace!(outstanding = self.outstanding, "start deferred until session end");
            self.schedule_restart();
            return false;
        }

        match self.recognizer.start(&self.options) {
            Ok(()) => {
                self.requested = true;
                self.outstanding += 1;
                debug!(language = %self.options.language, "recognition session requested");
                true
            }
            Err(err) => {
                self.failed_starts = self.failed_starts.saturating_add(1);
                warn!(%err, failures = self.failed_starts, "recognition session failed to start");
                self.schedule_restart();
                false
            }
        }
    }

    /// Request cessation. Idempotent.
    pub fn stop(&mut self) {
        if !self.requested {
            return;
        }
        self.requested = false;
        self.recognizer.stop();
        debug!("recognition session stop requested");
    }

    /// Classify a raw recognizer callback
    ///
    /// Returns `None` for callbacks that belong to a session the controller
    /// no longer listens to.
    pub fn observe(&mut self, signal: RecognizerSignal) -> Option<RecognitionEvent> {
        match signal {
            RecognizerSignal::Started => {
                self.failed_starts = 0;
                self.requested.then_some(RecognitionEvent::SessionStarted)
            }
            RecognizerSignal::Result {
                fragments,
                is_final,
            } => {
                if !self.requested {
                    trace!("dropping transcript from a stopped session");
                    return None;
                }
                let text = fragments.concat().trim().to_string();
                if text.is_empty() {
                    return None;
                }
                Some(if is_final {
                    RecognitionEvent::FinalTranscript { text }
                } else {
                    RecognitionEvent::InterimTranscript { text }
                })
            }
            RecognizerSignal::Ended { reason } => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if self.outstanding > 0 {
                    trace!(%reason, "earlier session ended");
                    return None;
                }
                self.requested = false;
                if self.may_listen() {
                    self.schedule_restart();
                }
                Some(RecognitionEvent::SessionEnded { reason })
            }
            RecognizerSignal::Error { code } => {
                let kind = RecognitionErrorKind::from_code(&code);
                if kind == RecognitionErrorKind::PermissionDenied {
                    info!(%code, "recognizer reports microphone permission denied");
                    self.permission = PermissionState::Denied;
                    self.disable();
                    return Some(RecognitionEvent::RecognitionError { kind });
                }
                if !self.requested {
                    trace!(%code, "ignoring error from a stopped session");
                    return None;
                }
                Some(RecognitionEvent::RecognitionError { kind })
            }
        }
    }

    /// Debounced restart fired
    pub fn on_restart_due(&mut self, generation: u64) {
        if generation != self.restart_generation {
            return;
        }
        if self.may_listen() && !self.requested {
            self.start();
        }
    }

    fn schedule_restart(&mut self) {
        self.restart_generation += 1;
        let delay = self.restart_backoff();
        trace!(?delay, "recognition restart scheduled");
        self.restart_timer.arm(
            delay,
            &self.queue,
            ControllerEvent::RestartDue {
                generation: self.restart_generation,
            },
        );
    }

    fn restart_backoff(&self) -> Duration {
        let doublings = self.failed_starts.saturating_sub(1).min(16);
        self.restart_delay
            .saturating_mul(1u32 << doublings)
            .min(self.backoff_max)
            .max(self.restart_delay)
    }
}
