//! Microphone permission state and its observer
//!
//! The permission can change underneath the daemon at any time (the user
//! revokes access in system settings), so a monitor polls the provider and
//! forwards every change to the controller queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::state::ControllerEvent;

/// Process-wide microphone permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    Unknown,
    Prompt,
    Granted,
    Denied,
}

impl PermissionState {
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

impl std::fmt::Display for PermissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionState::Unknown => write!(f, "unknown"),
            PermissionState::Prompt => write!(f, "prompt"),
            PermissionState::Granted => write!(f, "granted"),
            PermissionState::Denied => write!(f, "denied"),
        }
    }
}

/// Platform capability that knows and can request microphone access
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Current state without prompting
    fn query(&self) -> PermissionState;

    /// Prompt the user; resolves to the resulting state
    async fn request(&self) -> PermissionState;
}

/// Polls a provider and enqueues changes
pub struct PermissionMonitor {
    provider: Arc<dyn PermissionProvider>,
    queue: mpsc::Sender<ControllerEvent>,
    interval: Duration,
}

impl PermissionMonitor {
    pub fn new(
        provider: Arc<dyn PermissionProvider>,
        queue: mpsc::Sender<ControllerEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            queue,
            interval,
        }
    }

    /// Run until the controller queue closes
    pub async fn run(self) {
        let mut last = self.provider.query();
        info!(permission = %last, "permission monitor started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let current = self.provider.query();
            if current == last {
                continue;
            }

            debug!(from = %last, to = %current, "permission change observed");
            last = current;
            if self.queue.send(ControllerEvent::Permission(current)).await.is_err() {
                break;
            }
        }

        debug!("permission monitor stopped");
    }
}
