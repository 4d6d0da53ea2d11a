//! Unix domain socket server for IPC
//!
//! Provides request-response communication, state event notifications for
//! subscribed clients, and the command feed for the registered platform
//! client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::bridge::{PlatformCommand, PlatformHub, PlatformLink};
use crate::events::StateEvent;
use crate::recognition::RecognizerSignal;
use crate::state::{ControlCommand, ControllerEvent, ControllerHandle};

use super::protocol::{read_frame, write_message, DaemonStatus, Notification, Request, Response};

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Everything a connection handler needs
struct Shared {
    controller: ControllerHandle,
    hub: Arc<PlatformHub>,
    events: broadcast::Sender<StateEvent>,
    start_time: std::time::Instant,
}

/// What a request changes about its connection
enum Effect {
    None,
    Subscribe,
    Register,
}

impl Server {
    /// Bind the socket and create the server
    pub fn new(
        socket_path: &Path,
        controller: ControllerHandle,
        hub: Arc<PlatformHub>,
        events: broadcast::Sender<StateEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .context("failed to restrict socket permissions")?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            shared: Arc::new(Shared {
                controller,
                hub,
                events,
                start_time: std::time::Instant::now(),
            }),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let shared = Arc::clone(&self.shared);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, shared) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        // frames are read on their own task so notifications never wait on a
        // half-read request
        let (request_tx, mut request_rx) = mpsc::channel::<Result<Request, String>>(16);
        let read_task = tokio::spawn(async move {
            loop {
                let body = match read_frame(&mut reader).await {
                    Ok(Some(body)) => body,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(?e, "dropping client");
                        break;
                    }
                };
                let request = serde_json::from_slice(&body).map_err(|e| e.to_string());
                if request_tx.send(request).await.is_err() {
                    break;
                }
            }
        });

        let mut subscription: Option<broadcast::Receiver<StateEvent>> = None;
        let mut platform: Option<PlatformLink> = None;

        let result: Result<()> = async {
            loop {
                tokio::select! {
                    request = request_rx.recv() => {
                        let Some(request) = request else {
                            debug!("client disconnected");
                            return Ok(());
                        };
                        let response = match request {
                            Ok(request) => {
                                debug!(?request, "received request");
                                let (response, effect) = Self::process_request(request, &shared).await;
                                match effect {
                                    Effect::Subscribe => {
                                        subscription = Some(shared.events.subscribe());
                                        debug!("client subscribed to notifications");
                                    }
                                    Effect::Register if platform.is_none() => {
                                        platform = Some(shared.hub.register());
                                    }
                                    _ => {}
                                }
                                response
                            }
                            Err(e) => Response::error("bad_request", e),
                        };
                        write_message(&mut writer, &response).await?;
                    }
                    Some(event) = next_event(&mut subscription) => {
                        write_message(&mut writer, &Notification::StateEvent { event }).await?;
                    }
                    Some(command) = next_command(&mut platform) => {
                        write_message(&mut writer, &Notification::PlatformCommand { command }).await?;
                    }
                }
            }
        }
        .await;

        read_task.abort();
        result
    }

    /// Process a request and return a response
    async fn process_request(request: Request, shared: &Shared) -> (Response, Effect) {
        let controller = &shared.controller;
        let forwarded = match request {
            Request::Ping => return (Response::Pong, Effect::None),

            Request::GetStatus => {
                let status = DaemonStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    state: controller.state(),
                    permission: controller.permission(),
                    platform_connected: shared.hub.is_connected(),
                    uptime_secs: shared.start_time.elapsed().as_secs(),
                };
                return (Response::Status(status), Effect::None);
            }

            Request::Subscribe => return (Response::Subscribed, Effect::Subscribe),
            Request::RegisterPlatform => return (Response::Registered, Effect::Register),

            Request::Activate => controller.control(ControlCommand::Activate).await,
            Request::Cancel => controller.control(ControlCommand::Cancel).await,
            Request::Pause => controller.control(ControlCommand::Pause).await,
            Request::Resume => controller.control(ControlCommand::Resume).await,

            Request::RecognizerStarted => {
                controller
                    .send(ControllerEvent::Recognizer(RecognizerSignal::Started))
                    .await
            }
            Request::RecognizerResult {
                fragments,
                is_final,
            } => {
                controller
                    .send(ControllerEvent::Recognizer(RecognizerSignal::Result {
                        fragments,
                        is_final,
                    }))
                    .await
            }
            Request::RecognizerEnded { reason } => {
                shared.hub.session_ended();
                controller
                    .send(ControllerEvent::Recognizer(RecognizerSignal::Ended { reason }))
                    .await
            }
            Request::RecognizerError { code } => {
                controller
                    .send(ControllerEvent::Recognizer(RecognizerSignal::Error { code }))
                    .await
            }
            Request::SpeechFinished { utterance, error } => {
                shared.hub.speech_finished(utterance, error);
                Ok(())
            }
            Request::PermissionChanged { permission } => {
                shared.hub.set_permission(permission);
                controller.send(ControllerEvent::Permission(permission)).await
            }
        };

        match forwarded {
            Ok(()) => (Response::Ack, Effect::None),
            Err(e) => (Response::error("unavailable", e.to_string()), Effect::None),
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Next state event for a subscribed client; pends forever otherwise
async fn next_event(subscription: &mut Option<broadcast::Receiver<StateEvent>>) -> Option<StateEvent> {
    let Some(rx) = subscription.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "subscriber lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                *subscription = None;
                return None;
            }
        }
    }
}

/// Next command for a registered platform client; pends forever otherwise
async fn next_command(platform: &mut Option<PlatformLink>) -> Option<PlatformCommand> {
    let Some(link) = platform.as_mut() else {
        return std::future::pending().await;
    };
    let command = link.recv().await;
    if command.is_none() {
        info!("another platform client took over");
        *platform = None;
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionState;
    use crate::state::InteractionState;
    use crate::testing::Harness;
    use std::time::Duration;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("horizon-{}-{}.sock", name, std::process::id()))
    }

    async fn request(stream: &mut UnixStream, request: &Request) -> Response {
        write_message(stream, request).await.unwrap();
        let body = read_frame(stream).await.unwrap().unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn wait_for_passive(h: &Harness) {
        let mut state = h.handle.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == InteractionState::PassiveListening),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_ping_status_and_control() {
        let h = Harness::start(PermissionState::Granted);
        wait_for_passive(&h).await;

        let path = socket_path("status");
        let (event_tx, _) = broadcast::channel(16);
        let hub = PlatformHub::new(h.queue.clone());
        let server = Arc::new(Server::new(&path, h.handle.clone(), hub, event_tx).unwrap());
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        assert_eq!(request(&mut stream, &Request::Ping).await, Response::Pong);

        match request(&mut stream, &Request::GetStatus).await {
            Response::Status(status) => {
                assert_eq!(status.state, InteractionState::PassiveListening);
                assert_eq!(status.permission, PermissionState::Granted);
                assert!(!status.platform_connected);
            }
            other => panic!("unexpected response {:?}", other),
        }

        assert_eq!(request(&mut stream, &Request::Activate).await, Response::Ack);
        let mut state = h.handle.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == InteractionState::Active),
        )
        .await
        .unwrap()
        .unwrap();

        server.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bad_request_keeps_connection() {
        let h = Harness::start(PermissionState::Granted);
        let path = socket_path("bad");
        let (event_tx, _) = broadcast::channel(16);
        let hub = PlatformHub::new(h.queue.clone());
        let server = Arc::new(Server::new(&path, h.handle.clone(), hub, event_tx).unwrap());
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        write_message(&mut stream, &serde_json::json!({"type": "set_mode"}))
            .await
            .unwrap();
        let body = read_frame(&mut stream).await.unwrap().unwrap();
        let response: Response = serde_json::from_slice(&body).unwrap();
        assert!(matches!(response, Response::Error { ref code, .. } if code == "bad_request"));

        assert_eq!(request(&mut stream, &Request::Ping).await, Response::Pong);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_platform_client_receives_commands_and_subscriber_events() {
        let h = Harness::start(PermissionState::Granted);
        let path = socket_path("platform");
        let (event_tx, _) = broadcast::channel(16);
        let hub = PlatformHub::new(h.queue.clone());
        let server = Arc::new(
            Server::new(&path, h.handle.clone(), hub.clone(), event_tx.clone()).unwrap(),
        );
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        let mut platform = UnixStream::connect(&path).await.unwrap();
        assert_eq!(
            request(&mut platform, &Request::RegisterPlatform).await,
            Response::Registered
        );
        assert!(hub.is_connected());

        hub.send(PlatformCommand::Navigate {
            route: "/users".into(),
        })
        .unwrap();
        let body = read_frame(&mut platform).await.unwrap().unwrap();
        let note: Notification = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            note,
            Notification::PlatformCommand {
                command: PlatformCommand::Navigate {
                    route: "/users".into()
                }
            }
        );

        let mut observer = UnixStream::connect(&path).await.unwrap();
        assert_eq!(
            request(&mut observer, &Request::Subscribe).await,
            Response::Subscribed
        );
        let event = StateEvent::Navigated {
            route: "/users".into(),
        };
        event_tx.send(event.clone()).unwrap();
        let body = read_frame(&mut observer).await.unwrap().unwrap();
        let note: Notification = serde_json::from_slice(&body).unwrap();
        assert_eq!(note, Notification::StateEvent { event });

        drop(platform);
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_platform_client_takes_over() {
        let h = Harness::start(PermissionState::Granted);
        let path = socket_path("takeover");
        let (event_tx, _) = broadcast::channel(16);
        let hub = PlatformHub::new(h.queue.clone());
        let server = Arc::new(Server::new(&path, h.handle.clone(), hub.clone(), event_tx).unwrap());
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        let mut first = UnixStream::connect(&path).await.unwrap();
        assert_eq!(
            request(&mut first, &Request::RegisterPlatform).await,
            Response::Registered
        );
        let mut second = UnixStream::connect(&path).await.unwrap();
        assert_eq!(
            request(&mut second, &Request::RegisterPlatform).await,
            Response::Registered
        );

        hub.send(PlatformCommand::Navigate {
            route: "/users".into(),
        })
        .unwrap();
        let body = read_frame(&mut second).await.unwrap().unwrap();
        let note: Notification = serde_json::from_slice(&body).unwrap();
        assert!(matches!(note, Notification::PlatformCommand { .. }));

        // the replaced client is still served as a plain client
        assert_eq!(request(&mut first, &Request::Ping).await, Response::Pong);
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.is_connected());

        server.shutdown().await;
    }
}
