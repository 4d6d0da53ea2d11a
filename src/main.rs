//! horizon-voiced: voice interaction daemon for the Horizon dashboard
//!
//! This daemon runs as a user service and provides:
//! - Passive wake-phrase listening and command capture
//! - An explicit state machine sequencing recognition, dispatch and speech
//! - Dispatch of commands to the interpretation service and CRUD backend
//! - IPC server for the dashboard, which hosts microphone and speaker
//!
//! Audio capture and synthesis stay in the platform client; the daemon only
//! tells it when to listen and what to say.

mod bridge;
mod command;
mod config;
mod dispatch;
mod error;
mod events;
mod ipc;
mod lifecycle;
mod permission;
mod recognition;
mod speech;
mod state;
#[cfg(test)]
mod testing;
mod timer;
mod wake;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bridge::{
    BridgeNavigator, BridgePermission, BridgeRecognizer, BridgeSynthesizer, PlatformHub,
};
use crate::config::Config;
use crate::dispatch::{HttpActionSink, HttpInterpreter};
use crate::events::StateEvent;
use crate::ipc::Server;
use crate::permission::PermissionMonitor;
use crate::state::{Collaborators, Controller};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "horizon-voiced starting");

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, api_url = %config.api_url, "configuration loaded");

    // Everything that happens to the controller arrives on this queue
    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    // Controller -> observers (IPC subscribers, log)
    let (event_tx, _event_rx) = broadcast::channel::<StateEvent>(64);

    let hub = PlatformHub::new(queue_tx.clone());
    let http = reqwest::Client::builder()
        .timeout(config.voice.timings.dispatch_timeout)
        .build()
        .context("failed to build HTTP client")?;

    let permissions = Arc::new(BridgePermission::new(hub.clone()));
    let collaborators = Collaborators {
        recognizer: Arc::new(BridgeRecognizer::new(hub.clone())),
        synthesizer: Arc::new(BridgeSynthesizer::new(hub.clone())),
        permissions: permissions.clone(),
        interpreter: Arc::new(HttpInterpreter::new(http.clone(), &config.api_url)),
        navigator: Arc::new(BridgeNavigator::new(hub.clone())),
        actions: Arc::new(HttpActionSink::new(http, &config.api_url)),
    };

    let mut controller = Controller::new(
        config.voice.clone(),
        collaborators,
        queue_tx.clone(),
        event_tx.clone(),
    );
    let handle = controller.handle();

    let monitor = PermissionMonitor::new(
        permissions,
        queue_tx,
        config.voice.timings.permission_poll,
    );

    let server = Server::new(&config.socket_path, handle.clone(), hub, event_tx.clone())?;

    tokio::spawn(async move {
        if let Err(e) = lifecycle::wait_for_shutdown(handle).await {
            error!(?e, "failed to install signal handlers");
        }
    });

    let mut log_rx = event_tx.subscribe();

    info!("daemon initialized, entering main loop");

    // Main event loop; the controller leaves its loop on a shutdown signal
    tokio::select! {
        _ = controller.run(queue_rx) => {
            info!("controller exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        _ = monitor.run() => {
            warn!("permission monitor exited");
        }

        // Log what observers see
        _ = async {
            loop {
                match log_rx.recv().await {
                    Ok(event) => info!(%event, "state event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "state event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("state event handler exited");
        }
    }

    // Cleanup
    info!(state = %controller.state(), "shutting down...");

    controller.shutdown();
    server.shutdown().await;

    info!("horizon-voiced stopped");

    Ok(())
}
