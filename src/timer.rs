//! One-shot timers that deliver their expiry through the controller queue
//!
//! Aborting a timer cannot retract an event that was already enqueued, so
//! every timer event carries a generation that the receiver checks.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::state::ControllerEvent;

/// A single pending delayed event; re-arming replaces the previous one
#[derive(Debug, Default)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` on `queue` after `delay`, cancelling any earlier arm
    pub fn arm(
        &mut self,
        delay: Duration,
        queue: &mpsc::Sender<ControllerEvent>,
        event: ControllerEvent,
    ) {
        self.cancel();
        let queue = queue.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.send(event).await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
