//! Voice interaction state machine
//!
//! Provides an explicit state machine with six states:
//! - Idle: not listening (no permission yet, or paused)
//! - PassiveListening: listening for the wake phrase only
//! - Active: capturing a command
//! - Processing: waiting for the interpretation service
//! - Speaking: reading out the reply or a farewell
//! - Error: microphone permission denied

mod machine;
mod queue;

pub use machine::{Collaborators, Controller, InteractionState};
pub use queue::{ControlCommand, ControllerEvent, ControllerHandle};
