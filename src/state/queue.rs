//! The controller's single inbound queue
//!
//! Recognizer callbacks, permission changes, control commands, timer expiries
//! and remote-call completions all arrive here and are applied one at a time.

use tokio::sync::{mpsc, watch};

use crate::dispatch::{ApiCall, DispatchResult};
use crate::error::{DispatchError, VoiceError};
use crate::permission::PermissionState;
use crate::recognition::RecognizerSignal;

use super::InteractionState;

/// Commands from the user interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Same as hearing the wake phrase
    Activate,
    /// Abandon whatever is in progress and listen passively again
    Cancel,
    /// Stop listening altogether
    Pause,
    /// Listen passively again after a pause
    Resume,
    /// Leave the event loop
    Shutdown,
}

#[derive(Debug)]
pub enum ControllerEvent {
    Recognizer(RecognizerSignal),
    Permission(PermissionState),
    Control(ControlCommand),
    RestartDue {
        generation: u64,
    },
    SilenceElapsed {
        generation: u64,
    },
    IdleTimeout {
        generation: u64,
    },
    PlaybackFinished {
        utterance: u64,
        error: Option<String>,
    },
    SettleElapsed {
        utterance: u64,
    },
    DispatchCompleted {
        episode: u64,
        result: Result<DispatchResult, DispatchError>,
    },
    ActionCompleted {
        episode: u64,
        call: ApiCall,
        result: Result<(), DispatchError>,
        message: String,
        follow_up: Option<String>,
    },
    NavigationDue {
        episode: u64,
        route: String,
    },
}

/// Cloneable access to a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    queue: mpsc::Sender<ControllerEvent>,
    state: watch::Receiver<InteractionState>,
    permission: watch::Receiver<PermissionState>,
}

impl ControllerHandle {
    pub(super) fn new(
        queue: mpsc::Sender<ControllerEvent>,
        state: watch::Receiver<InteractionState>,
        permission: watch::Receiver<PermissionState>,
    ) -> Self {
        Self {
            queue,
            state,
            permission,
        }
    }

    pub fn state(&self) -> InteractionState {
        *self.state.borrow()
    }

    pub fn permission(&self) -> PermissionState {
        *self.permission.borrow()
    }

    /// Watch state changes
    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<InteractionState> {
        self.state.clone()
    }

    pub async fn send(&self, event: ControllerEvent) -> Result<(), VoiceError> {
        self.queue
            .send(event)
            .await
            .map_err(|_| VoiceError::ControllerStopped)
    }

    pub async fn control(&self, command: ControlCommand) -> Result<(), VoiceError> {
        self.send(ControllerEvent::Control(command)).await
    }
}
