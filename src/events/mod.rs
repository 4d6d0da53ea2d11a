//! Events module for observers of the voice controller
//!
//! Published on a broadcast channel; observers that lag or disappear never
//! hold up the controller.

use serde::{Deserialize, Serialize};

use crate::permission::PermissionState;
use crate::state::InteractionState;

/// Events emitted by the controller for UIs and other observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// Interaction state changed
    StateChanged {
        from: InteractionState,
        to: InteractionState,
        /// Milliseconds spent in the previous state
        duration_ms: u64,
    },

    /// Microphone permission changed
    PermissionChanged { permission: PermissionState },

    /// Recognizer heard something
    Transcript { text: String, is_final: bool },

    /// A command was finalized and sent for interpretation
    CommandCaptured { text: String },

    /// The assistant is answering
    Response { message: String },

    /// A backend action ran
    ActionInvoked {
        method: String,
        endpoint: String,
        success: bool,
    },

    /// Navigation was handed to the navigation sink
    Navigated { route: String },

    /// Transient, non-fatal condition worth showing
    Status { message: String },
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::StateChanged {
                from,
                to,
                duration_ms,
            } => write!(f, "STATE_CHANGED {} -> {} ({}ms)", from, to, duration_ms),
            StateEvent::PermissionChanged { permission } => {
                write!(f, "PERMISSION_CHANGED ({})", permission)
            }
            StateEvent::Transcript { text, is_final } => {
                let kind = if *is_final { "final" } else { "interim" };
                write!(f, "TRANSCRIPT {} \"{}\"", kind, text)
            }
            StateEvent::CommandCaptured { text } => write!(f, "COMMAND_CAPTURED \"{}\"", text),
            StateEvent::Response { message } => write!(f, "RESPONSE \"{}\"", message),
            StateEvent::ActionInvoked {
                method,
                endpoint,
                success,
            } => {
                let outcome = if *success { "ok" } else { "failed" };
                write!(f, "ACTION_INVOKED {} {} ({})", method, endpoint, outcome)
            }
            StateEvent::Navigated { route } => write!(f, "NAVIGATED {}", route),
            StateEvent::Status { message } => write!(f, "STATUS {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = StateEvent::StateChanged {
            from: InteractionState::PassiveListening,
            to: InteractionState::Active,
            duration_ms: 1500,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("state_changed"));
        assert!(json.contains("passive_listening"));
        assert!(json.contains("1500"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"navigated","route":"/users"}"#;
        let event: StateEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            StateEvent::Navigated {
                route: "/users".into()
            }
        );
    }

    #[test]
    fn test_display() {
        let event = StateEvent::Transcript {
            text: "hello horizon".into(),
            is_final: false,
        };
        assert_eq!(event.to_string(), "TRANSCRIPT interim \"hello horizon\"");
    }
}
