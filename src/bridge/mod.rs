//! Platform bridge
//!
//! The microphone, the speech synthesizer and the permission prompt belong
//! to a platform client (the dashboard page) connected over IPC. The hub
//! turns capability calls into [`PlatformCommand`]s pushed to that client and
//! routes its reports back to whoever is waiting on them.
//!
//! Only one platform client is served at a time. A new registration takes
//! over from the previous one, whose session and utterances are closed out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::dispatch::NavigationSink;
use crate::error::VoiceError;
use crate::permission::{PermissionProvider, PermissionState};
use crate::recognition::{Recognizer, RecognizerOptions, RecognizerSignal};
use crate::speech::Synthesizer;
use crate::state::ControllerEvent;

/// Instructions for the platform client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PlatformCommand {
    StartRecognition { continuous: bool, language: String },
    StopRecognition,
    Speak {
        utterance: u64,
        text: String,
        voice: Option<String>,
    },
    CancelSpeech,
    RequestPermission,
    Navigate { route: String },
}

/// Commands a platform client may fall behind by before sends fail
const COMMAND_BUFFER: usize = 64;

type SpeechWaiter = oneshot::Sender<Result<(), VoiceError>>;

/// The registered platform client's end of the command feed
struct ActiveLink {
    id: u64,
    commands: mpsc::Sender<PlatformCommand>,
}

/// Shared state between the capability adapters and the IPC server
pub struct PlatformHub {
    link: Mutex<Option<ActiveLink>>,
    next_link: AtomicU64,
    permission: watch::Sender<PermissionState>,
    pending_speech: Mutex<HashMap<u64, SpeechWaiter>>,
    next_utterance: AtomicU64,
    /// A recognition session was started and its end not reported yet
    recognizing: AtomicBool,
    queue: mpsc::Sender<ControllerEvent>,
}

impl PlatformHub {
    pub fn new(queue: mpsc::Sender<ControllerEvent>) -> Arc<Self> {
        let (permission, _) = watch::channel(PermissionState::Unknown);
        Arc::new(Self {
            link: Mutex::new(None),
            next_link: AtomicU64::new(0),
            permission,
            pending_speech: Mutex::new(HashMap::new()),
            next_utterance: AtomicU64::new(0),
            recognizing: AtomicBool::new(false),
            queue,
        })
    }

    /// Register a platform client; it receives commands until the link
    /// drops or a later registration replaces it
    pub fn register(self: &Arc<Self>) -> PlatformLink {
        let id = self.next_link.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let previous = self.lock_link().replace(ActiveLink { id, commands: tx });

        match previous {
            Some(previous) => {
                info!(link = id, replaced = previous.id, "platform client took over");
                self.release("platform client replaced");
            }
            None => info!(link = id, "platform client registered"),
        }

        PlatformLink {
            hub: Arc::clone(self),
            id,
            commands: rx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock_link().is_some()
    }

    pub fn send(&self, command: PlatformCommand) -> Result<(), VoiceError> {
        let link = self.lock_link();
        let Some(link) = link.as_ref() else {
            return Err(VoiceError::PlatformUnavailable);
        };
        debug!(link = link.id, ?command, "platform command");
        link.commands.try_send(command).map_err(|err| {
            if let TrySendError::Full(command) = err {
                warn!(link = link.id, ?command, "platform client is not reading commands");
            }
            VoiceError::PlatformUnavailable
        })
    }

    pub fn permission(&self) -> PermissionState {
        *self.permission.borrow()
    }

    pub fn set_permission(&self, permission: PermissionState) {
        self.permission.send_replace(permission);
    }

    /// The platform reported the end of a recognition session
    pub fn session_ended(&self) {
        self.recognizing.store(false, Ordering::SeqCst);
    }

    /// The platform reported the end of an utterance
    pub fn speech_finished(&self, utterance: u64, error: Option<String>) {
        let waiter = self.lock_pending().remove(&utterance);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(match error {
                    Some(error) => Err(VoiceError::Synthesis(error)),
                    None => Ok(()),
                });
            }
            None => debug!(utterance, "completion for an utterance nobody waits on"),
        }
    }

    fn next_utterance(&self) -> u64 {
        self.next_utterance.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, SpeechWaiter>> {
        // a poisoned map still holds valid senders
        self.pending_speech
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fail_pending_speech(&self, error: impl Fn() -> VoiceError) {
        for (_, waiter) in self.lock_pending().drain() {
            let _ = waiter.send(Err(error()));
        }
    }

    fn unregistered(&self, id: u64) {
        {
            let mut link = self.lock_link();
            if link.as_ref().map(|link| link.id) != Some(id) {
                debug!(link = id, "replaced platform client closed");
                return;
            }
            *link = None;
        }
        info!(link = id, "platform client unregistered");
        self.release("platform disconnected");
    }

    /// Close out what the departing client still owed: its utterances and
    /// its recognition session
    fn release(&self, reason: &str) {
        self.fail_pending_speech(|| VoiceError::PlatformUnavailable);
        if self.recognizing.swap(false, Ordering::SeqCst) {
            let ended = ControllerEvent::Recognizer(RecognizerSignal::Ended {
                reason: reason.to_string(),
            });
            if self.queue.try_send(ended).is_err() {
                warn!("could not report the end of the recognition session");
            }
        }
    }
}

/// A registered platform client's command feed
pub struct PlatformLink {
    hub: Arc<PlatformHub>,
    id: u64,
    commands: mpsc::Receiver<PlatformCommand>,
}

impl PlatformLink {
    /// Next command for the platform; `None` once another client took over
    pub async fn recv(&mut self) -> Option<PlatformCommand> {
        self.commands.recv().await
    }
}

impl Drop for PlatformLink {
    fn drop(&mut self) {
        self.hub.unregistered(self.id);
    }
}

pub struct BridgeRecognizer {
    hub: Arc<PlatformHub>,
}

impl BridgeRecognizer {
    pub fn new(hub: Arc<PlatformHub>) -> Self {
        Self { hub }
    }
}

impl Recognizer for BridgeRecognizer {
    fn start(&self, options: &RecognizerOptions) -> Result<(), VoiceError> {
        self.hub.send(PlatformCommand::StartRecognition {
            continuous: options.continuous,
            language: options.language.clone(),
        })?;
        self.hub.recognizing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        if let Err(err) = self.hub.send(PlatformCommand::StopRecognition) {
            debug!(%err, "stop not delivered");
        }
    }
}

pub struct BridgeSynthesizer {
    hub: Arc<PlatformHub>,
}

impl BridgeSynthesizer {
    pub fn new(hub: Arc<PlatformHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Synthesizer for BridgeSynthesizer {
    async fn speak(&self, text: &str, voice: Option<&str>) -> Result<(), VoiceError> {
        let utterance = self.hub.next_utterance();
        let (tx, rx) = oneshot::channel();
        self.hub.lock_pending().insert(utterance, tx);

        let sent = self.hub.send(PlatformCommand::Speak {
            utterance,
            text: text.to_string(),
            voice: voice.map(str::to_string),
        });
        if let Err(err) = sent {
            self.hub.lock_pending().remove(&utterance);
            return Err(err);
        }

        rx.await.unwrap_or(Err(VoiceError::Cancelled))
    }

    fn cancel_all(&self) {
        self.hub.fail_pending_speech(|| VoiceError::Cancelled);
        if let Err(err) = self.hub.send(PlatformCommand::CancelSpeech) {
            debug!(%err, "cancel not delivered");
        }
    }
}

pub struct BridgePermission {
    hub: Arc<PlatformHub>,
}

impl BridgePermission {
    pub fn new(hub: Arc<PlatformHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl PermissionProvider for BridgePermission {
    fn query(&self) -> PermissionState {
        self.hub.permission()
    }

    async fn request(&self) -> PermissionState {
        let mut changes = self.hub.permission.subscribe();
        if let Err(err) = self.hub.send(PlatformCommand::RequestPermission) {
            debug!(%err, "permission request not delivered");
            return self.query();
        }

        while changes.changed().await.is_ok() {
            let permission = *changes.borrow_and_update();
            if matches!(permission, PermissionState::Granted | PermissionState::Denied) {
                return permission;
            }
        }
        self.query()
    }
}

pub struct BridgeNavigator {
    hub: Arc<PlatformHub>,
}

impl BridgeNavigator {
    pub fn new(hub: Arc<PlatformHub>) -> Self {
        Self { hub }
    }
}

impl NavigationSink for BridgeNavigator {
    fn navigate(&self, route: &str) {
        let command = PlatformCommand::Navigate {
            route: route.to_string(),
        };
        if let Err(err) = self.hub.send(command) {
            warn!(%err, route, "navigation dropped");
        }
    }
}
