//! Persistent push connection: connect, keepalive, reconnect.
//!
//! One supervisor task owns the socket. Any closure that was not requested
//! through [`PushConnection::disconnect`] (including a failed connect)
//! schedules exactly one new attempt after the fixed reconnect delay, forever.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::KEEPALIVE_PING;
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{config::Timings, error::TransportError, events::SessionEvent, progress::ProgressTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[async_trait]
pub trait PushSocket: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;
    /// Next inbound text frame; `None` once the peer closed the connection.
    async fn next_text(&mut self) -> Option<Result<String, TransportError>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn PushSocket>, TransportError>;
}

pub struct WebSocketConnector;

struct WebSocketSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn PushSocket>, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| TransportError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Box::new(WebSocketSocket { stream }))
    }
}

#[async_trait]
impl PushSocket for WebSocketSocket {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(_))) | None => return None,
                // Protocol-level ping/pong is answered by tungstenite.
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(TransportError::Receive(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!(error = %err, "push: close handshake failed");
        }
    }
}

struct PushShared {
    url: String,
    connector: Arc<dyn PushConnector>,
    tracker: ProgressTracker,
    keepalive: Duration,
    reconnect_delay: Duration,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl PushShared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        let was_connected = previous == ConnectionState::Connected;
        let is_connected = next == ConnectionState::Connected;
        if was_connected != is_connected {
            let _ = self.events.send(SessionEvent::ConnectionChanged {
                connected: is_connected,
            });
        }
    }
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Shutdown,
}

pub struct PushConnection {
    shared: Arc<PushShared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl PushConnection {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn PushConnector>,
        tracker: ProgressTracker,
        timings: Timings,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(PushShared {
                url: url.into(),
                connector,
                tracker,
                keepalive: timings.keepalive,
                reconnect_delay: timings.reconnect_delay,
                state,
                events,
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Starts the supervisor unless one is already running. While it runs the
    /// connection is either open or waiting for its next attempt, so a second
    /// call never opens a second socket.
    pub async fn connect(&self) {
        let mut guard = self.supervisor.lock().await;
        if let Some(running) = guard.as_ref() {
            if !running.handle.is_finished() {
                return;
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(supervise(shared, shutdown_rx));
        *guard = Some(Supervisor { shutdown, handle });
    }

    /// Closes the socket and cancels keepalive and any pending reconnect.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(Supervisor { shutdown, handle }) = supervisor {
            let _ = shutdown.send(true);
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "push: supervisor ended abnormally");
                }
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for PushConnection {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.supervisor.try_lock() {
            if let Some(supervisor) = guard.take() {
                supervisor.handle.abort();
            }
        }
    }
}

async fn supervise(shared: Arc<PushShared>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        shared.set_state(ConnectionState::Connecting);
        info!(url = %shared.url, attempt, "push: connecting");

        let opened = tokio::select! {
            opened = shared.connector.open(&shared.url) => opened,
            _ = shutdown.changed() => break,
        };

        match opened {
            Ok(socket) => {
                shared.set_state(ConnectionState::Connected);
                info!(url = %shared.url, attempt, "push: connected");
                if run_session(&shared, socket, &mut shutdown).await == SessionEnd::Shutdown {
                    break;
                }
                warn!(url = %shared.url, "push: connection closed");
            }
            Err(err) => warn!(error = %err, attempt, "push: connect failed"),
        }

        shared.set_state(ConnectionState::Disconnected);
        info!(
            delay_ms = shared.reconnect_delay.as_millis() as u64,
            "push: reconnect scheduled"
        );
        tokio::select! {
            _ = tokio::time::sleep(shared.reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    shared.set_state(ConnectionState::Disconnected);
    debug!(url = %shared.url, "push: supervisor stopped");
}

async fn run_session(
    shared: &PushShared,
    mut socket: Box<dyn PushSocket>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + shared.keepalive, shared.keepalive);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                socket.close().await;
                return SessionEnd::Shutdown;
            }
            _ = keepalive.tick() => {
                if let Err(err) = socket.send_text(KEEPALIVE_PING).await {
                    warn!(error = %err, "push: keepalive failed");
                    return SessionEnd::Closed;
                }
                debug!("push: keepalive sent");
            }
            frame = socket.next_text() => match frame {
                Some(Ok(text)) => shared.tracker.ingest(&text).await,
                Some(Err(err)) => {
                    warn!(error = %err, "push: receive failed");
                    return SessionEnd::Closed;
                }
                None => return SessionEnd::Closed,
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
