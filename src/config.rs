//! Configuration loading and management
//!
//! Defaults are overlaid by an optional TOML file, then by environment
//! variables. Every field in the file is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Base URL of the dashboard API (interpretation + CRUD endpoints)
    pub api_url: String,

    /// Capacity of the controller's inbound event queue
    pub queue_capacity: usize,

    /// Voice interaction settings
    pub voice: VoiceSettings,
}

/// Everything the voice controller needs to know about phrases, prompts,
/// recognizer options and timing
#[derive(Debug, Clone)]
pub struct VoiceSettings {
    /// BCP-47 language tag handed to the recognizer
    pub language: String,
    /// Voice hint handed to the synthesizer
    pub voice: Option<String>,
    pub wake_phrases: Vec<String>,
    pub deactivation_phrases: Vec<String>,
    /// Ask for microphone access at startup when the state is undecided
    pub request_permission_on_start: bool,
    pub prompts: Prompts,
    pub timings: Timings,
}

/// Fixed utterances spoken by the assistant
#[derive(Debug, Clone)]
pub struct Prompts {
    pub greeting: String,
    pub farewell: String,
    pub timeout_farewell: String,
    pub apology: String,
    pub action_failed: String,
    pub not_understood: String,
}

/// Timer durations used across the pipeline
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Minimum delay before restarting a recognition session
    pub restart_delay: Duration,
    /// Ceiling for the restart backoff after failed starts
    pub restart_backoff_max: Duration,
    /// Silence after the last transcript before a command is finalized
    pub silence: Duration,
    /// Pause between the end of playback and resumed listening
    pub settle: Duration,
    /// Time allowed in Active without a command
    pub idle_timeout: Duration,
    /// Delay between starting the reply and navigating
    pub navigation_delay: Duration,
    /// Delay between a successful create and showing its page
    pub create_navigation_delay: Duration,
    /// Window after a cancel in which transcripts are ignored
    pub cancel_guard: Duration,
    /// Deadline for the interpretation service
    pub dispatch_timeout: Duration,
    pub permission_poll: Duration,
    pub permission_request_timeout: Duration,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            greeting: "Hello! I'm Horizon, your AI assistant. How can I help you today?".into(),
            farewell: "Goodbye! Say 'Hello Horizon' to activate me again.".into(),
            timeout_farewell: "I didn't hear a command. Say 'Hello Horizon' when you need me."
                .into(),
            apology: "Sorry, I encountered an error processing your request.".into(),
            action_failed: "Sorry, there was an error creating the resource. Please try again."
                .into(),
            not_understood: "Sorry, I didn't catch that.".into(),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(100),
            restart_backoff_max: Duration::from_millis(5_000),
            silence: Duration::from_millis(3_000),
            settle: Duration::from_millis(500),
            idle_timeout: Duration::from_millis(10_000),
            navigation_delay: Duration::from_millis(1_000),
            create_navigation_delay: Duration::from_millis(1_500),
            cancel_guard: Duration::from_millis(500),
            dispatch_timeout: Duration::from_millis(30_000),
            permission_poll: Duration::from_millis(2_000),
            permission_request_timeout: Duration::from_millis(30_000),
        }
    }
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            language: "en-US".into(),
            voice: None,
            wake_phrases: vec!["hello horizon".into(), "hey horizon".into()],
            deactivation_phrases: vec![
                "goodbye".into(),
                "stop listening".into(),
                "deactivate".into(),
                "go to sleep".into(),
            ],
            request_permission_on_start: true,
            prompts: Prompts::default(),
            timings: Timings::default(),
        }
    }
}

/// On-disk schema; a partial overlay on top of the defaults
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    socket_path: Option<PathBuf>,
    api_url: Option<String>,
    queue_capacity: Option<usize>,
    #[serde(default)]
    voice: VoiceFile,
    #[serde(default)]
    prompts: PromptsFile,
    #[serde(default)]
    timings: TimingsFile,
}

#[derive(Debug, Default, Deserialize)]
struct VoiceFile {
    language: Option<String>,
    voice: Option<String>,
    wake_phrases: Option<Vec<String>>,
    deactivation_phrases: Option<Vec<String>>,
    request_permission_on_start: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptsFile {
    greeting: Option<String>,
    farewell: Option<String>,
    timeout_farewell: Option<String>,
    apology: Option<String>,
    action_failed: Option<String>,
    not_understood: Option<String>,
}

/// All values in milliseconds
#[derive(Debug, Default, Deserialize)]
struct TimingsFile {
    restart_delay_ms: Option<u64>,
    restart_backoff_max_ms: Option<u64>,
    silence_ms: Option<u64>,
    settle_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    navigation_delay_ms: Option<u64>,
    create_navigation_delay_ms: Option<u64>,
    cancel_guard_ms: Option<u64>,
    dispatch_timeout_ms: Option<u64>,
    permission_poll_ms: Option<u64>,
    permission_request_timeout_ms: Option<u64>,
}

impl Config {
    /// Load configuration from defaults, the config file and environment
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("horizon");

        let mut config = Self::with_data_dir(data_dir);

        let file_path = std::env::var_os("HORIZON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| config.data_dir.join("config.toml"));
        if file_path.exists() {
            config.apply_file(&file_path)?;
        }

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Defaults rooted at the given data directory
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            socket_path: data_dir.join("horizon.sock"),
            data_dir,
            api_url: "http://localhost:8050".into(),
            queue_capacity: 64,
            voice: VoiceSettings::default(),
        }
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        Ok(())
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        self.apply_toml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "config file applied");
        Ok(())
    }

    fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: ConfigFile = toml::from_str(raw)?;

        if let Some(path) = file.socket_path {
            self.socket_path = path;
        }
        if let Some(url) = file.api_url {
            self.api_url = url;
        }
        if let Some(capacity) = file.queue_capacity {
            self.queue_capacity = capacity.max(1);
        }

        let voice = &mut self.voice;
        overlay(&mut voice.language, file.voice.language);
        if file.voice.voice.is_some() {
            voice.voice = file.voice.voice;
        }
        overlay(&mut voice.wake_phrases, file.voice.wake_phrases);
        overlay(&mut voice.deactivation_phrases, file.voice.deactivation_phrases);
        overlay(
            &mut voice.request_permission_on_start,
            file.voice.request_permission_on_start,
        );

        let prompts = &mut voice.prompts;
        overlay(&mut prompts.greeting, file.prompts.greeting);
        overlay(&mut prompts.farewell, file.prompts.farewell);
        overlay(&mut prompts.timeout_farewell, file.prompts.timeout_farewell);
        overlay(&mut prompts.apology, file.prompts.apology);
        overlay(&mut prompts.action_failed, file.prompts.action_failed);
        overlay(&mut prompts.not_understood, file.prompts.not_understood);

        let t = &mut voice.timings;
        let ms = file.timings;
        overlay_ms(&mut t.restart_delay, ms.restart_delay_ms);
        overlay_ms(&mut t.restart_backoff_max, ms.restart_backoff_max_ms);
        overlay_ms(&mut t.silence, ms.silence_ms);
        overlay_ms(&mut t.settle, ms.settle_ms);
        overlay_ms(&mut t.idle_timeout, ms.idle_timeout_ms);
        overlay_ms(&mut t.navigation_delay, ms.navigation_delay_ms);
        overlay_ms(&mut t.create_navigation_delay, ms.create_navigation_delay_ms);
        overlay_ms(&mut t.cancel_guard, ms.cancel_guard_ms);
        overlay_ms(&mut t.dispatch_timeout, ms.dispatch_timeout_ms);
        overlay_ms(&mut t.permission_poll, ms.permission_poll_ms);
        overlay_ms(&mut t.permission_request_timeout, ms.permission_request_timeout_ms);

        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("HORIZON_SOCKET") {
            self.socket_path = PathBuf::from(path);
        }
        if let Some(url) = var("HORIZON_API_URL") {
            self.api_url = url;
        }
        if let Some(language) = var("HORIZON_LANGUAGE") {
            self.voice.language = language;
        }
        if let Some(voice) = var("HORIZON_VOICE") {
            self.voice.voice = Some(voice);
        }
    }
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn overlay_ms(slot: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *slot = Duration::from_millis(ms);
    }
}
