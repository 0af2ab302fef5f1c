//! One managed WebSocket connection.
//!
//! A [`WsConnection`] is created per connect attempt and never reused: the
//! persistent client replaces it wholesale on reconnect. States move
//! connecting → open → closed, never backwards and never skipping.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use tether_core::ConnectionParamsMessage;

use crate::socket::{SocketConnector, SocketEvent, SocketSink};
use crate::TransportError;

/// Close code reported when the connection-params handshake cannot be built.
pub const CONNECTION_PARAMS_FAILED_CLOSE_CODE: u16 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Events surfaced to the owning client.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A protocol frame (keep-alive frames are consumed internally).
    Message(String),
    /// The connection is gone. Emitted exactly once.
    Closed(Option<TransportError>),
}

/// Async URL provider, so callers can compute the URL (auth tokens etc.) per
/// connect attempt. A failure here is fatal and stops reconnection.
pub type UrlProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, TransportError>> + Send + Sync>;

/// Builds the one-time connection-params payload sent right after open.
pub type ConnectionParamsProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, TransportError>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    /// Idle interval after which a PING is sent.
    pub interval: Duration,
    /// How long to wait for the PONG before force-closing.
    pub pong_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            enabled: false,
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct ConnectOptions {
    pub url: UrlProvider,
    pub connector: Arc<dyn SocketConnector>,
    pub keep_alive: KeepAliveConfig,
    pub connection_params: Option<ConnectionParamsProvider>,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>, connector: Arc<dyn SocketConnector>) -> Self {
        let url = url.into();
        ConnectOptions {
            url: Arc::new(move || {
                let url = url.clone();
                Box::pin(async move { Ok(url) })
            }),
            connector,
            keep_alive: KeepAliveConfig::default(),
            connection_params: None,
        }
    }
}

enum Command {
    Send(String),
    Close,
}

/// Handle to one live connection. Dropping it does not close the socket;
/// the owning client issues an explicit `close`.
pub struct WsConnection {
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<Mutex<ConnectionState>>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl WsConnection {
    /// Dials a fresh connection.
    ///
    /// Resolves the URL, connects the socket, performs the connection-params
    /// handshake when configured, then spawns the pump task. Returns the
    /// handle plus the event stream for this connection only.
    pub async fn open(
        id: u64,
        opts: ConnectOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), TransportError> {
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));

        let url = (opts.url)().await.map_err(|e| match e {
            TransportError::FatalSetup(m) => TransportError::FatalSetup(m),
            other => TransportError::FatalSetup(other.to_string()),
        })?;

        debug!(connection_id = id, %url, "opening websocket connection");
        let (sink, socket_rx) = opts.connector.connect(&url).await?;

        if let Some(params) = &opts.connection_params {
            let data = match params().await {
                Ok(data) => data,
                Err(e) => {
                    warn!(connection_id = id, error = %e, "connection params build failed, closing socket");
                    sink.close().await;
                    return Err(TransportError::FatalSetup(format!(
                        "connection params failed (close code {}): {}",
                        CONNECTION_PARAMS_FAILED_CLOSE_CODE, e
                    )));
                }
            };
            let message = serde_json::to_string(&ConnectionParamsMessage::new(data))
                .map_err(|e| TransportError::Codec(e.to_string()))?;
            sink.send(message).await?;
        }

        set_state(&state, ConnectionState::Open);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let pump_state = state.clone();
        tokio::spawn(pump(
            id,
            sink,
            socket_rx,
            cmd_rx,
            event_tx,
            opts.keep_alive,
            pump_state,
        ));

        Ok((WsConnection { id, cmd_tx, state }, event_rx))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queues one outbound text frame.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Command::Send(text))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Asks the pump to close the socket. Idempotent. The connection
    /// reports closed right away so callers stop handing it frames while
    /// the teardown is still in flight.
    pub fn close(&self) {
        set_state(&self.state, ConnectionState::Closed);
        let _ = self.cmd_tx.send(Command::Close);
    }
}

fn set_state(state: &Arc<Mutex<ConnectionState>>, next: ConnectionState) {
    let mut guard = match state.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    };
    *guard = next;
}

async fn maybe_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn pump(
    id: u64,
    sink: Box<dyn SocketSink>,
    mut socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    keep_alive: KeepAliveConfig,
    state: Arc<Mutex<ConnectionState>>,
) {
    let mut ping_deadline = keep_alive
        .enabled
        .then(|| Instant::now() + keep_alive.interval);
    let mut pong_deadline: Option<Instant> = None;

    let closed = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if let Err(e) = sink.send(text).await {
                        break Some(e);
                    }
                }
                Some(Command::Close) | None => {
                    sink.close().await;
                    break None;
                }
            },
            event = socket_rx.recv() => match event {
                Some(SocketEvent::Message(text)) => {
                    // Any inbound traffic counts as liveness.
                    if keep_alive.enabled {
                        ping_deadline = Some(Instant::now() + keep_alive.interval);
                    }
                    if text == "PING" {
                        trace!(connection_id = id, "answering keep-alive ping");
                        if let Err(e) = sink.send("PONG".to_string()).await {
                            break Some(e);
                        }
                    } else if text == "PONG" {
                        pong_deadline = None;
                    } else if event_tx.send(ConnectionEvent::Message(text)).is_err() {
                        sink.close().await;
                        break None;
                    }
                }
                Some(SocketEvent::Closed(err)) => break err,
                None => break None,
            },
            _ = maybe_deadline(ping_deadline), if ping_deadline.is_some() => {
                trace!(connection_id = id, "sending keep-alive ping");
                if let Err(e) = sink.send("PING".to_string()).await {
                    break Some(e);
                }
                pong_deadline = Some(Instant::now() + keep_alive.pong_timeout);
                ping_deadline = Some(Instant::now() + keep_alive.interval);
            },
            _ = maybe_deadline(pong_deadline), if pong_deadline.is_some() => {
                warn!(connection_id = id, "keep-alive pong timed out, force-closing");
                sink.close().await;
                break Some(TransportError::KeepAliveTimeout);
            },
        }
    };

    set_state(&state, ConnectionState::Closed);
    debug!(connection_id = id, "connection closed");
    let _ = event_tx.send(ConnectionEvent::Closed(closed));
}
