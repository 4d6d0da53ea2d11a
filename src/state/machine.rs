//! Core state machine implementation
//!
//! Sequences passive listening, command capture, dispatch and spoken replies.
//! Every input reaches the controller through one queue and is handled by a
//! synchronous method, so no two transitions ever overlap. Asynchronous work
//! (remote calls, playback, timers) runs in spawned tasks whose only effect is
//! to enqueue a completion event tagged with the episode or generation that
//! issued it; completions from an abandoned episode are discarded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::command::{CommandBuffer, Ingest};
use crate::config::VoiceSettings;
use crate::dispatch::{ActionSink, ApiCall, DispatchResult, Interpreter, NavigationSink};
use crate::error::DispatchError;
use crate::events::StateEvent;
use crate::permission::{PermissionProvider, PermissionState};
use crate::recognition::{
    RecognitionErrorKind, RecognitionEvent, RecognitionSupervisor, Recognizer, RecognizerOptions,
};
use crate::speech::{Priority, SpeechArbiter, Synthesizer};
use crate::timer::Timer;
use crate::wake::{PhraseSet, WakePhraseDetector};

use super::queue::{ControlCommand, ControllerEvent, ControllerHandle};

/// Consecutive recoverable recognition errors in Active before the user is told
const ACTIVE_ISSUE_LIMIT: u32 = 2;

/// The six interaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionState {
    /// Not listening
    #[default]
    Idle,
    /// Listening for the wake phrase
    PassiveListening,
    /// Capturing a command
    Active,
    /// Waiting for the interpretation service
    Processing,
    /// Reading out a reply
    Speaking,
    /// Microphone permission denied
    Error,
}

impl std::fmt::Display for InteractionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InteractionState::Idle => write!(f, "Idle"),
            InteractionState::PassiveListening => write!(f, "PassiveListening"),
            InteractionState::Active => write!(f, "Active"),
            InteractionState::Processing => write!(f, "Processing"),
            InteractionState::Speaking => write!(f, "Speaking"),
            InteractionState::Error => write!(f, "Error"),
        }
    }
}

/// Platform capabilities and remote services the controller drives
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn Recognizer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub interpreter: Arc<dyn Interpreter>,
    pub navigator: Arc<dyn NavigationSink>,
    pub actions: Arc<dyn ActionSink>,
}

/// The voice interaction controller
pub struct Controller {
    /// Current state
    state: InteractionState,
    /// Last permission seen
    permission: PermissionState,
    /// Bumped whenever the current interaction is abandoned
    episode: u64,
    /// Time when the current state was entered
    state_entered_at: Instant,
    /// Transcripts before this instant are trailing audio of a cancelled interaction
    guard_until: Option<Instant>,
    /// Recoverable recognition errors in a row while Active
    active_issues: u32,
    /// A manual activation is waiting on the permission prompt
    activate_on_grant: bool,

    settings: VoiceSettings,
    wake: WakePhraseDetector,
    recognition: RecognitionSupervisor,
    buffer: CommandBuffer,
    speech: SpeechArbiter,
    idle_timer: Timer,
    idle_generation: u64,
    navigation_timer: Timer,
    /// Remote call of the current episode
    pending_call: Option<JoinHandle<()>>,

    permissions: Arc<dyn PermissionProvider>,
    interpreter: Arc<dyn Interpreter>,
    navigator: Arc<dyn NavigationSink>,
    actions: Arc<dyn ActionSink>,

    queue: mpsc::Sender<ControllerEvent>,
    event_tx: broadcast::Sender<StateEvent>,
    state_tx: watch::Sender<InteractionState>,
    permission_tx: watch::Sender<PermissionState>,
}

impl Controller {
    /// Create a controller that schedules its own timers on `queue`
    pub fn new(
        settings: VoiceSettings,
        collaborators: Collaborators,
        queue: mpsc::Sender<ControllerEvent>,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> Self {
        let timings = settings.timings;
        let recognition = RecognitionSupervisor::new(
            collaborators.recognizer,
            RecognizerOptions {
                continuous: true,
                language: settings.language.clone(),
            },
            queue.clone(),
            timings.restart_delay,
            timings.restart_backoff_max,
        );
        let buffer = CommandBuffer::new(
            timings.silence,
            PhraseSet::new(&settings.deactivation_phrases),
            queue.clone(),
        );
        let speech = SpeechArbiter::new(
            collaborators.synthesizer,
            settings.voice.clone(),
            queue.clone(),
            timings.settle,
        );
        let wake_phrases = PhraseSet::new(&settings.wake_phrases);
        if wake_phrases.is_empty() {
            warn!("no wake phrases configured, only manual activation will work");
        }
        let wake = WakePhraseDetector::new(wake_phrases);
        let (state_tx, _) = watch::channel(InteractionState::Idle);
        let (permission_tx, _) = watch::channel(PermissionState::Unknown);

        Self {
            state: InteractionState::Idle,
            permission: PermissionState::Unknown,
            episode: 0,
            state_entered_at: Instant::now(),
            guard_until: None,
            active_issues: 0,
            activate_on_grant: false,
            settings,
            wake,
            recognition,
            buffer,
            speech,
            idle_timer: Timer::new(),
            idle_generation: 0,
            navigation_timer: Timer::new(),
            pending_call: None,
            permissions: collaborators.permissions,
            interpreter: collaborators.interpreter,
            navigator: collaborators.navigator,
            actions: collaborators.actions,
            queue,
            event_tx,
            state_tx,
            permission_tx,
        }
    }

    /// Get the current state
    pub fn state(&self) -> InteractionState {
        self.state
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle::new(
            self.queue.clone(),
            self.state_tx.subscribe(),
            self.permission_tx.subscribe(),
        )
    }

    /// Run the controller until the queue closes or a shutdown command arrives
    pub async fn run(&mut self, mut queue_rx: mpsc::Receiver<ControllerEvent>) {
        info!("voice controller started in Idle state");
        self.bootstrap();

        while let Some(event) = queue_rx.recv().await {
            if matches!(event, ControllerEvent::Control(ControlCommand::Shutdown)) {
                break;
            }
            self.handle_event(event);
        }

        self.shutdown();
        info!("voice controller stopped");
    }

    /// Stop listening and speaking
    pub fn shutdown(&mut self) {
        self.abandon_episode();
    }

    fn bootstrap(&mut self) {
        let permission = self.permissions.query();
        debug!(%permission, "initial microphone permission");
        self.on_permission(permission);

        if matches!(permission, PermissionState::Prompt | PermissionState::Unknown)
            && self.settings.request_permission_on_start
        {
            self.request_permission();
        }
    }

    fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Recognizer(signal) => {
                if let Some(event) = self.recognition.observe(signal) {
                    self.on_recognition(event);
                }
            }
            ControllerEvent::Permission(permission) => self.on_permission(permission),
            ControllerEvent::Control(command) => self.on_control(command),
            ControllerEvent::RestartDue { generation } => {
                self.recognition.on_restart_due(generation);
            }
            ControllerEvent::SilenceElapsed { generation } => self.on_silence(generation),
            ControllerEvent::IdleTimeout { generation } => self.on_idle_timeout(generation),
            ControllerEvent::PlaybackFinished { utterance, error } => {
                self.speech.playback_finished(utterance, error.as_deref());
            }
            ControllerEvent::SettleElapsed { utterance } => {
                if self.speech.settled(utterance, &mut self.recognition) {
                    self.on_speech_complete();
                }
            }
            ControllerEvent::DispatchCompleted { episode, result } => {
                self.on_dispatch_completed(episode, result);
            }
            ControllerEvent::ActionCompleted {
                episode,
                call,
                result,
                message,
                follow_up,
            } => self.on_action_completed(episode, call, result, message, follow_up),
            ControllerEvent::NavigationDue { episode, route } => {
                self.on_navigation_due(episode, &route);
            }
        }
    }

    // --- permission -------------------------------------------------------

    fn on_permission(&mut self, permission: PermissionState) {
        // any answer settles an activation that was waiting on the prompt
        let activate = std::mem::take(&mut self.activate_on_grant) && permission.is_granted();
        if permission == self.permission {
            return;
        }

        info!(from = %self.permission, to = %permission, "microphone permission changed");
        self.permission = permission;
        self.permission_tx.send_replace(permission);
        self.recognition.set_permission(permission);
        self.emit(StateEvent::PermissionChanged { permission });

        match permission {
            PermissionState::Granted => {
                if matches!(self.state, InteractionState::Idle | InteractionState::Error) {
                    self.enter_passive();
                }
                if activate && self.state == InteractionState::PassiveListening {
                    info!("permission granted, completing manual activation");
                    self.activate();
                }
            }
            PermissionState::Denied => {
                self.abandon_episode();
                self.transition_to(InteractionState::Error);
                self.emit(StateEvent::Status {
                    message: "Microphone access denied. Please allow microphone access.".into(),
                });
            }
            PermissionState::Prompt | PermissionState::Unknown => {
                if self.state != InteractionState::Idle {
                    self.abandon_episode();
                    self.transition_to(InteractionState::Idle);
                }
            }
        }
    }

    fn request_permission(&self) {
        let provider = Arc::clone(&self.permissions);
        let queue = self.queue.clone();
        let deadline = self.settings.timings.permission_request_timeout;
        debug!("requesting microphone permission");
        tokio::spawn(async move {
            let permission = match tokio::time::timeout(deadline, provider.request()).await {
                Ok(permission) => permission,
                Err(_) => {
                    warn!("permission request went unanswered");
                    provider.query()
                }
            };
            let _ = queue.send(ControllerEvent::Permission(permission)).await;
        });
    }

    // --- control ----------------------------------------------------------

    fn on_control(&mut self, command: ControlCommand) {
        debug!(?command, state = %self.state, "control command");
        match command {
            ControlCommand::Activate => match self.state {
                InteractionState::PassiveListening => self.activate(),
                InteractionState::Idle | InteractionState::Error
                    if !self.permission.is_granted() =>
                {
                    self.activate_on_grant = true;
                    self.request_permission();
                }
                InteractionState::Idle => {
                    self.enter_passive();
                    self.activate();
                }
                _ => debug!("activation ignored, interaction in progress"),
            },
            ControlCommand::Cancel => self.cancel(),
            ControlCommand::Pause => {
                self.activate_on_grant = false;
                if !matches!(self.state, InteractionState::Idle | InteractionState::Error) {
                    self.abandon_episode();
                    self.transition_to(InteractionState::Idle);
                }
            }
            ControlCommand::Resume => {
                if self.state == InteractionState::Idle && self.permission.is_granted() {
                    self.enter_passive();
                }
            }
            // handled by the run loop
            ControlCommand::Shutdown => {}
        }
    }

    fn cancel(&mut self) {
        self.activate_on_grant = false;
        // Error is left only through a permission grant; nothing to halt there
        if matches!(self.state, InteractionState::Idle | InteractionState::Error) {
            debug!(state = %self.state, "nothing to cancel");
            return;
        }

        info!(
            state = %self.state,
            episode = self.episode,
            discarded = %self.buffer.text(),
            navigation_pending = self.navigation_timer.is_armed(),
            "interaction cancelled"
        );
        self.abandon_episode();
        self.guard_until = Some(Instant::now() + self.settings.timings.cancel_guard);

        if self.permission.is_granted() {
            self.recognition.enable();
            self.transition_to(InteractionState::PassiveListening);
        } else {
            self.transition_to(InteractionState::Idle);
        }
    }

    /// Invalidate everything the current interaction left in flight and
    /// close the microphone. Intent is dropped before the stop is issued.
    fn abandon_episode(&mut self) {
        self.episode += 1;
        self.recognition.disable();
        self.speech.cancel(&mut self.recognition);
        self.buffer.clear();
        self.idle_timer.cancel();
        self.navigation_timer.cancel();
        if let Some(call) = self.pending_call.take() {
            call.abort();
        }
    }

    // --- listening --------------------------------------------------------

    fn enter_passive(&mut self) {
        self.buffer.clear();
        self.idle_timer.cancel();
        self.recognition.enable();
        self.transition_to(InteractionState::PassiveListening);
    }

    fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::SessionStarted => trace!("recognition session live"),
            RecognitionEvent::SessionEnded { reason } => {
                trace!(
                    %reason,
                    restarting = self.recognition.wants_to_listen(),
                    "recognition session ended"
                );
            }
            RecognitionEvent::InterimTranscript { text } => self.on_transcript(text, false),
            RecognitionEvent::FinalTranscript { text } => self.on_transcript(text, true),
            RecognitionEvent::RecognitionError { kind } => self.on_recognition_error(kind),
        }
    }

    fn on_transcript(&mut self, text: String, is_final: bool) {
        self.emit(StateEvent::Transcript {
            text: text.clone(),
            is_final,
        });

        if self.guard_until.is_some_and(|until| Instant::now() < until) {
            debug!(%text, "transcript inside cancel guard window ignored");
            return;
        }

        match self.state {
            InteractionState::PassiveListening => {
                if self.wake.detect(&text) {
                    info!(%text, "wake phrase detected");
                    self.activate();
                }
            }
            InteractionState::Active => match self.buffer.ingest(&text, is_final) {
                Ingest::Buffered => {
                    self.active_issues = 0;
                    self.arm_idle_timeout();
                }
                Ingest::Deactivate => {
                    info!("deactivation requested");
                    let farewell = self.settings.prompts.farewell.clone();
                    self.speak_reply(&farewell);
                }
            },
            _ => trace!(state = %self.state, "transcript ignored"),
        }
    }

    fn on_recognition_error(&mut self, kind: RecognitionErrorKind) {
        match kind {
            RecognitionErrorKind::PermissionDenied => {
                self.on_permission(PermissionState::Denied);
            }
            RecognitionErrorKind::NetworkError => {
                warn!("recognition network error, session will restart");
                self.emit(StateEvent::Status {
                    message: "Network error. Please check your connection.".into(),
                });
            }
            RecognitionErrorKind::NoSpeechTimeout | RecognitionErrorKind::Other => {
                debug!(%kind, "recoverable recognition error");
                if self.state != InteractionState::Active {
                    return;
                }
                self.active_issues += 1;
                if self.active_issues >= ACTIVE_ISSUE_LIMIT {
                    self.active_issues = 0;
                    self.emit(StateEvent::Status {
                        message: kind.to_string(),
                    });
                    self.speech.speak(
                        &self.settings.prompts.not_understood,
                        Priority::Normal,
                        &mut self.recognition,
                    );
                }
            }
        }
    }

    // --- command capture --------------------------------------------------

    fn activate(&mut self) {
        self.buffer.clear();
        self.active_issues = 0;
        self.transition_to(InteractionState::Active);
        self.arm_idle_timeout();
        self.speech.speak(
            &self.settings.prompts.greeting,
            Priority::High,
            &mut self.recognition,
        );
    }

    fn arm_idle_timeout(&mut self) {
        self.idle_generation += 1;
        self.idle_timer.arm(
            self.settings.timings.idle_timeout,
            &self.queue,
            ControllerEvent::IdleTimeout {
                generation: self.idle_generation,
            },
        );
    }

    fn on_idle_timeout(&mut self, generation: u64) {
        if generation != self.idle_generation || self.state != InteractionState::Active {
            return;
        }
        info!("no command heard, returning to passive listening");
        let farewell = self.settings.prompts.timeout_farewell.clone();
        self.speak_reply(&farewell);
    }

    fn on_silence(&mut self, generation: u64) {
        if self.state != InteractionState::Active {
            return;
        }
        if let Some(command) = self.buffer.finalize(generation) {
            self.dispatch(command);
        }
    }

    // --- dispatch ---------------------------------------------------------

    fn dispatch(&mut self, command: String) {
        info!(%command, episode = self.episode, "dispatching command");
        self.emit(StateEvent::CommandCaptured {
            text: command.clone(),
        });
        self.transition_to(InteractionState::Processing);

        let interpreter = Arc::clone(&self.interpreter);
        let queue = self.queue.clone();
        let episode = self.episode;
        let deadline = self.settings.timings.dispatch_timeout;

        self.pending_call = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(deadline, interpreter.interpret(&command)).await
            {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Timeout(deadline)),
            };
            let _ = queue
                .send(ControllerEvent::DispatchCompleted { episode, result })
                .await;
        }));
    }

    fn is_current(&self, episode: u64) -> bool {
        episode == self.episode && self.state == InteractionState::Processing
    }

    fn on_dispatch_completed(
        &mut self,
        episode: u64,
        result: Result<DispatchResult, DispatchError>,
    ) {
        if !self.is_current(episode) {
            debug!(episode, current = self.episode, "discarding stale dispatch result");
            return;
        }
        self.pending_call = None;
        if let Ok(answer) = &result {
            debug!(message = answer.message(), "interpretation received");
        }

        match result {
            Ok(DispatchResult::Navigate { route, message }) => {
                self.speak_reply(&message);
                self.schedule_navigation(route, self.settings.timings.navigation_delay);
            }
            Ok(DispatchResult::Invoke {
                call,
                message,
                follow_up,
            }) => self.invoke_action(call, message, follow_up),
            Ok(DispatchResult::Say { message }) | Ok(DispatchResult::Unknown { message }) => {
                self.speak_reply(&message);
            }
            Err(err) => {
                warn!(%err, "dispatch failed");
                let apology = self.settings.prompts.apology.clone();
                self.speak_reply(&apology);
            }
        }
    }

    fn invoke_action(&mut self, call: ApiCall, message: String, follow_up: Option<String>) {
        info!(method = %call.method, endpoint = %call.endpoint, "invoking action");
        let actions = Arc::clone(&self.actions);
        let queue = self.queue.clone();
        let episode = self.episode;
        let deadline = self.settings.timings.dispatch_timeout;

        self.pending_call = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(deadline, actions.invoke(&call)).await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Timeout(deadline)),
            };
            let _ = queue
                .send(ControllerEvent::ActionCompleted {
                    episode,
                    call,
                    result,
                    message,
                    follow_up,
                })
                .await;
        }));
    }

    fn on_action_completed(
        &mut self,
        episode: u64,
        call: ApiCall,
        result: Result<(), DispatchError>,
        message: String,
        follow_up: Option<String>,
    ) {
        if !self.is_current(episode) {
            debug!(episode, current = self.episode, "discarding stale action result");
            return;
        }
        self.pending_call = None;

        let success = result.is_ok();
        self.emit(StateEvent::ActionInvoked {
            method: call.method,
            endpoint: call.endpoint,
            success,
        });

        match result {
            Ok(()) => {
                self.speak_reply(&message);
                if let Some(route) = follow_up {
                    self.schedule_navigation(route, self.settings.timings.create_navigation_delay);
                }
            }
            Err(err) => {
                warn!(%err, "action failed");
                let apology = self.settings.prompts.action_failed.clone();
                self.speak_reply(&apology);
            }
        }
    }

    fn schedule_navigation(&mut self, route: String, delay: std::time::Duration) {
        self.navigation_timer.arm(
            delay,
            &self.queue,
            ControllerEvent::NavigationDue {
                episode: self.episode,
                route,
            },
        );
    }

    fn on_navigation_due(&mut self, episode: u64, route: &str) {
        if episode != self.episode {
            debug!(route, "discarding navigation of an abandoned interaction");
            return;
        }
        info!(route, "navigating");
        self.navigator.navigate(route);
        self.emit(StateEvent::Navigated {
            route: route.to_string(),
        });
    }

    // --- speaking ---------------------------------------------------------

    /// Read out `text` and return to passive listening once it is done
    fn speak_reply(&mut self, text: &str) {
        if text.trim().is_empty() {
            self.speech.cancel(&mut self.recognition);
            self.enter_passive();
            return;
        }

        self.emit(StateEvent::Response {
            message: text.to_string(),
        });
        self.transition_to(InteractionState::Speaking);
        self.speech.speak(text, Priority::High, &mut self.recognition);
    }

    fn on_speech_complete(&mut self) {
        if self.state == InteractionState::Speaking {
            self.transition_to(InteractionState::PassiveListening);
        }
    }

    // --- bookkeeping ------------------------------------------------------

    /// Perform a state transition
    fn transition_to(&mut self, new_state: InteractionState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }

        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;
        info!(
            from = %old_state,
            to = %new_state,
            duration_ms = duration_ms,
            "state transition"
        );

        if old_state == InteractionState::Active {
            self.buffer.clear();
            self.idle_timer.cancel();
        }

        self.state = new_state;
        self.state_entered_at = Instant::now();
        self.state_tx.send_replace(new_state);
        self.emit(StateEvent::StateChanged {
            from: old_state,
            to: new_state,
            duration_ms,
        });
    }

    fn emit(&self, event: StateEvent) {
        trace!(%event, "emitting state event");
        let _ = self.event_tx.send(event);
    }
}
