//! In-process fakes of the platform capabilities and remote services

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::config::VoiceSettings;
use crate::dispatch::{ActionSink, ApiCall, DispatchResult, Interpreter, NavigationSink};
use crate::error::{DispatchError, VoiceError};
use crate::events::StateEvent;
use crate::permission::{PermissionProvider, PermissionState};
use crate::recognition::{Recognizer, RecognizerOptions, RecognizerSignal};
use crate::speech::Synthesizer;
use crate::state::{
    Collaborators, ControlCommand, Controller, ControllerEvent, ControllerHandle,
    InteractionState,
};

/// Counts moments where the microphone and the speaker were live together
#[derive(Debug, Default)]
pub struct ExclusionProbe {
    recognizing: AtomicBool,
    /// Id of the utterance currently playing, 0 when silent
    speaking: AtomicU64,
    next_utterance: AtomicU64,
    violations: AtomicU32,
}

impl ExclusionProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn violations(&self) -> u32 {
        self.violations.load(Ordering::SeqCst)
    }

    fn mic_opened(&self) {
        self.recognizing.store(true, Ordering::SeqCst);
        if self.speaking.load(Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mic_closed(&self) {
        self.recognizing.store(false, Ordering::SeqCst);
    }

    fn playback_started(&self) -> u64 {
        if self.recognizing.load(Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        let id = self.next_utterance.fetch_add(1, Ordering::SeqCst) + 1;
        self.speaking.store(id, Ordering::SeqCst);
        id
    }

    fn playback_stopped(&self, id: u64) {
        let _ = self
            .speaking
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn silence(&self) {
        self.speaking.store(0, Ordering::SeqCst);
    }
}

/// Recognizer that reports `Started`/`Ended` through the controller queue
pub struct FakeRecognizer {
    queue: mpsc::Sender<ControllerEvent>,
    probe: Arc<ExclusionProbe>,
    live: AtomicBool,
    attempts: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
    fail: AtomicBool,
}

impl FakeRecognizer {
    pub fn new(queue: mpsc::Sender<ControllerEvent>, probe: Arc<ExclusionProbe>) -> Self {
        Self {
            queue,
            probe,
            live: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Successful starts
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    /// All starts, failed or not
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Deliver a transcript if the microphone is open; returns whether it was
    pub fn hear(&self, text: &str, is_final: bool) -> bool {
        if !self.is_live() {
            return false;
        }
        self.queue
            .try_send(ControllerEvent::Recognizer(RecognizerSignal::Result {
                fragments: vec![text.to_string()],
                is_final,
            }))
            .is_ok()
    }

    /// Deliver an error callback for the live session
    pub fn fail_with(&self, code: &str) {
        let _ = self
            .queue
            .try_send(ControllerEvent::Recognizer(RecognizerSignal::Error {
                code: code.to_string(),
            }));
    }
}

impl Recognizer for FakeRecognizer {
    fn start(&self, _options: &RecognizerOptions) -> Result<(), VoiceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::PlatformUnavailable);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.live.store(true, Ordering::SeqCst);
        self.probe.mic_opened();
        let _ = self
            .queue
            .try_send(ControllerEvent::Recognizer(RecognizerSignal::Started));
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
        self.probe.mic_closed();
        let _ = self
            .queue
            .try_send(ControllerEvent::Recognizer(RecognizerSignal::Ended {
                reason: "stopped".into(),
            }));
    }
}

/// Clears the probe's speaking flag however playback ends
struct PlaybackGuard {
    probe: Arc<ExclusionProbe>,
    id: u64,
}

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        self.probe.playback_stopped(self.id);
    }
}

/// Synthesizer whose utterances take a fixed time to play
pub struct FakeSynthesizer {
    probe: Arc<ExclusionProbe>,
    duration: Duration,
    spoken: Mutex<Vec<String>>,
    cancellations: AtomicU32,
    fail_next: AtomicBool,
}

impl FakeSynthesizer {
    pub fn new(probe: Arc<ExclusionProbe>, duration: Duration) -> Self {
        Self {
            probe,
            duration,
            spoken: Mutex::new(Vec::new()),
            cancellations: AtomicU32::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Every utterance handed to the synthesizer, in order
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn times_spoken(&self, text: &str) -> usize {
        self.spoken.lock().unwrap().iter().filter(|s| *s == text).count()
    }

    pub fn cancellations(&self) -> u32 {
        self.cancellations.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn speak(&self, text: &str, _voice: Option<&str>) -> Result<(), VoiceError> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(VoiceError::Synthesis("audio device busy".into()));
        }

        let _guard = PlaybackGuard {
            probe: self.probe.clone(),
            id: self.probe.playback_started(),
        };
        tokio::time::sleep(self.duration).await;
        Ok(())
    }

    fn cancel_all(&self) {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        self.probe.silence();
    }
}

/// Permission provider with a settable state
pub struct FakePermissions {
    state: Mutex<PermissionState>,
    /// What the user answers when prompted; `None` leaves the state as is
    answer: Mutex<Option<PermissionState>>,
    requests: AtomicU32,
}

impl FakePermissions {
    pub fn new(state: PermissionState) -> Self {
        Self {
            state: Mutex::new(state),
            answer: Mutex::new(None),
            requests: AtomicU32::new(0),
        }
    }

    pub fn set(&self, state: PermissionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn answer_with(&self, state: PermissionState) {
        *self.answer.lock().unwrap() = Some(state);
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionProvider for FakePermissions {
    fn query(&self) -> PermissionState {
        *self.state.lock().unwrap()
    }

    async fn request(&self) -> PermissionState {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(answer) = *self.answer.lock().unwrap() {
            self.set(answer);
        }
        self.query()
    }
}

/// Interpreter answering from a script, after a fixed delay
pub struct FakeInterpreter {
    delay: Duration,
    hang: AtomicBool,
    script: Mutex<VecDeque<Result<DispatchResult, DispatchError>>>,
    queries: Mutex<Vec<String>>,
}

impl FakeInterpreter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            hang: AtomicBool::new(false),
            script: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, result: Result<DispatchResult, DispatchError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Never answer again
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Interpreter for FakeInterpreter {
    async fn interpret(&self, query: &str) -> Result<DispatchResult, DispatchError> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(DispatchResult::Say {
                    message: "Okay.".into(),
                })
            })
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().unwrap().clone()
    }
}

impl NavigationSink for RecordingNavigator {
    fn navigate(&self, route: &str) {
        self.routes.lock().unwrap().push(route.to_string());
    }
}

#[derive(Default)]
pub struct RecordingActions {
    calls: Mutex<Vec<ApiCall>>,
    fail: AtomicBool,
    hang: AtomicBool,
}

impl RecordingActions {
    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActionSink for RecordingActions {
    async fn invoke(&self, call: &ApiCall) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push(call.clone());
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DispatchError::Status(500));
        }
        Ok(())
    }
}

/// A running controller wired to fakes
pub struct Harness {
    pub handle: ControllerHandle,
    pub queue: mpsc::Sender<ControllerEvent>,
    pub events: broadcast::Receiver<StateEvent>,
    pub probe: Arc<ExclusionProbe>,
    pub recognizer: Arc<FakeRecognizer>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub permissions: Arc<FakePermissions>,
    pub interpreter: Arc<FakeInterpreter>,
    pub navigator: Arc<RecordingNavigator>,
    pub actions: Arc<RecordingActions>,
    pub settings: VoiceSettings,
}

impl Harness {
    /// Controller with default settings; speech takes 400 ms, interpretation 200 ms
    pub fn start(permission: PermissionState) -> Self {
        Self::start_with(VoiceSettings::default(), permission)
    }

    pub fn start_with(settings: VoiceSettings, permission: PermissionState) -> Self {
        let (queue, queue_rx) = mpsc::channel(256);
        let (event_tx, events) = broadcast::channel(256);
        let probe = ExclusionProbe::new();

        let recognizer = Arc::new(FakeRecognizer::new(queue.clone(), probe.clone()));
        let synthesizer = Arc::new(FakeSynthesizer::new(
            probe.clone(),
            Duration::from_millis(400),
        ));
        let permissions = Arc::new(FakePermissions::new(permission));
        let interpreter = Arc::new(FakeInterpreter::new(Duration::from_millis(200)));
        let navigator = Arc::new(RecordingNavigator::default());
        let actions = Arc::new(RecordingActions::default());

        let collaborators = Collaborators {
            recognizer: recognizer.clone(),
            synthesizer: synthesizer.clone(),
            permissions: permissions.clone(),
            interpreter: interpreter.clone(),
            navigator: navigator.clone(),
            actions: actions.clone(),
        };

        let mut controller = Controller::new(settings.clone(), collaborators, queue.clone(), event_tx);
        let handle = controller.handle();
        tokio::spawn(async move { controller.run(queue_rx).await });

        Self {
            handle,
            queue,
            events,
            probe,
            recognizer,
            synthesizer,
            permissions,
            interpreter,
            navigator,
            actions,
            settings,
        }
    }

    pub fn state(&self) -> InteractionState {
        self.handle.state()
    }

    /// Let `ms` of virtual time pass in 10 ms steps
    pub async fn advance(&self, ms: u64) {
        for _ in 0..ms / 10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Speak into the microphone and let the controller handle it
    pub async fn say(&self, text: &str) -> bool {
        let heard = self.recognizer.hear(text, true);
        self.advance(10).await;
        heard
    }

    pub async fn control(&self, command: ControlCommand) {
        self.handle.control(command).await.unwrap();
        self.advance(10).await;
    }

    /// Wake the assistant and wait until the greeting is over
    pub async fn wake(&self) {
        assert!(self.say("hello horizon").await, "microphone was closed");
        assert_eq!(self.state(), InteractionState::Active);
        self.advance(1_000).await;
    }

    /// Everything published so far
    pub fn drain_events(&mut self) -> Vec<StateEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
