//! Process lifecycle: turning termination signals into an orderly stop

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

use crate::state::{ControlCommand, ControllerHandle};

/// Wait for SIGTERM or SIGINT, then ask the controller to stop listening and
/// leave its event loop
pub async fn wait_for_shutdown(controller: ControllerHandle) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            debug!("received SIGTERM");
        }
        _ = sigint.recv() => {
            debug!("received SIGINT");
        }
    }

    if let Err(e) = controller.control(ControlCommand::Shutdown).await {
        warn!(%e, "controller already stopped");
    }
    Ok(())
}
