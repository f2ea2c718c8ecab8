//! Streaming connection lifecycle.
//!
//! A background task owns the transport session. The public
//! [`ConnectionHandle`] talks to it over a command channel; the task
//! multiplexes commands, inbound frames and a single optional reconnect
//! deadline. Holding the deadline in one `Option<Instant>` is what keeps at
//! most one reconnect pending: scheduling again replaces it.
//!
//! An open attempt is bounded by the connect timeout and keeps listening
//! for commands, so a `disconnect` abandons a stalled handshake.
//!
//! ```text
//!  connect ─▶ Connecting ─ok─▶ Connected ─close/error─▶ Disconnected
//!                 │                                         │
//!                 └──────────────fail──────────────────────▶│
//!                                                           │ after delay
//!                 ◀─────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stadium_protocol::{decode, Frame, Update, PONG};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::traits::{Connection, Transport, TransportError};

/// Default delay between a close and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Default bound on a single open attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// An open attempt is in progress.
    Connecting,
    /// The session is open.
    Connected,
    /// No session; a reconnect may be pending.
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// User-facing status line.
    #[must_use]
    pub fn status_text(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected. Attempting to reconnect...",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_text())
    }
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Fixed delay before a reconnect attempt.
    pub reconnect_delay: Duration,
    /// Bound on a single open attempt; an elapsed attempt counts as a close.
    pub connect_timeout: Duration,
    /// Command channel capacity.
    pub command_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
            command_capacity: 16,
        }
    }
}

/// Manager counters.
#[derive(Debug, Default)]
pub struct ManagerStats {
    /// Open attempts, initial and reconnects.
    pub connect_attempts: AtomicU64,
    /// Reconnects scheduled after a close or failed open.
    pub reconnects_scheduled: AtomicU64,
    /// Text frames received.
    pub frames_received: AtomicU64,
    /// Frames dropped because they failed to decode.
    pub decode_errors: AtomicU64,
}

impl ManagerStats {
    /// Take a point-in-time copy.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ManagerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Open attempts.
    pub connect_attempts: u64,
    /// Reconnects scheduled.
    pub reconnects_scheduled: u64,
    /// Text frames received.
    pub frames_received: u64,
    /// Frames dropped on decode.
    pub decode_errors: u64,
}

/// Build the stream URL with the bearer token as the `token` query
/// parameter.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] if `endpoint` does not parse.
pub fn build_stream_url(endpoint: &str, token: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(endpoint)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

enum Command {
    Connect {
        url: String,
        done: oneshot::Sender<ConnectionState>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<ManagerStats>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect { .. } => f.write_str("Connect"),
            Command::Disconnect { .. } => f.write_str("Disconnect"),
        }
    }
}

impl ConnectionHandle {
    /// Open the stream at `endpoint`, authenticating with `token`.
    ///
    /// A no-op if a session is already open. Returns the state after the
    /// attempt; a failed or timed-out attempt leaves a reconnect scheduled.
    /// A second `connect` issued while an attempt is running returns
    /// [`ConnectionState::Connecting`] without starting another.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for a malformed endpoint, or
    /// [`TransportError::ConnectionClosed`] if the manager has stopped.
    pub async fn connect(
        &self,
        endpoint: &str,
        token: &str,
    ) -> Result<ConnectionState, TransportError> {
        let url = build_stream_url(endpoint, token)?;
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                url: url.into(),
                done,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the stream and cancel any pending reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the manager has
    /// stopped.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { done })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ManagerStats> {
        Arc::clone(&self.stats)
    }
}

/// The connection manager task.
pub struct ConnectionManager<T, M> {
    transport: T,
    sink: mpsc::Sender<M>,
    config: ManagerConfig,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<ManagerStats>,
    conn: Option<Box<dyn Connection>>,
    target: Option<String>,
    reconnect_at: Option<Instant>,
}

impl<T, M> ConnectionManager<T, M>
where
    T: Transport + 'static,
    M: From<Update> + Send + 'static,
{
    /// Spawn a manager that forwards decoded updates into `sink`.
    ///
    /// The task runs until every [`ConnectionHandle`] is dropped.
    #[must_use]
    pub fn spawn(
        transport: T,
        sink: mpsc::Sender<M>,
        config: ManagerConfig,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let stats = Arc::new(ManagerStats::default());

        let manager = ConnectionManager {
            transport,
            sink,
            config,
            commands: commands_rx,
            state: state_tx,
            stats: Arc::clone(&stats),
            conn: None,
            target: None,
            reconnect_at: None,
        };
        let task = tokio::spawn(manager.run());

        let handle = ConnectionHandle {
            commands: commands_tx,
            state: state_rx,
            stats,
        };
        (handle, task)
    }

    async fn run(mut self) {
        debug!(transport = self.transport.name(), "Connection manager started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect { url, done }) => {
                        self.connect(url).await;
                        let _ = done.send(*self.state.borrow());
                    }
                    Some(Command::Disconnect { done }) => {
                        self.disconnect().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                frame = recv_frame(&mut self.conn) => self.on_frame(frame).await,
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    info!("Reconnecting");
                    self.open().await;
                }
            }
        }

        self.disconnect().await;
        debug!("Connection manager stopped");
    }

    async fn connect(&mut self, url: String) {
        if self.conn.as_ref().is_some_and(|conn| conn.is_open()) {
            debug!("Stream already open");
            return;
        }

        self.target = Some(url);
        self.reconnect_at = None;
        self.open().await;
    }

    async fn open(&mut self) {
        let Some(url) = self.target.clone() else {
            return;
        };

        self.set_state(ConnectionState::Connecting);
        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let outcome = {
            let attempt =
                tokio::time::timeout(self.config.connect_timeout, self.transport.connect(&url));
            tokio::pin!(attempt);

            loop {
                tokio::select! {
                    result = &mut attempt => break Opening::Finished(result),
                    command = self.commands.recv() => match command {
                        Some(Command::Connect { done, .. }) => {
                            debug!("Open already in progress");
                            let _ = done.send(ConnectionState::Connecting);
                        }
                        Some(Command::Disconnect { done }) => break Opening::Aborted(done),
                        None => break Opening::Stopped,
                    },
                }
            }
        };

        match outcome {
            Opening::Finished(Ok(Ok(conn))) => {
                info!(session = %conn.id(), "Stream connected");
                self.conn = Some(conn);
                self.set_state(ConnectionState::Connected);
            }
            Opening::Finished(Ok(Err(e))) => {
                warn!("Stream connect failed: {}", e);
                self.on_closed();
            }
            Opening::Finished(Err(_)) => {
                warn!(
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "Stream connect timed out"
                );
                self.on_closed();
            }
            Opening::Aborted(done) => {
                info!("Open abandoned by disconnect");
                self.disconnect().await;
                let _ = done.send(());
            }
            Opening::Stopped => {
                self.target = None;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn disconnect(&mut self) {
        self.target = None;
        self.reconnect_at = None;

        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!(session = %conn.id(), "Close failed: {}", e);
            }
            info!(session = %conn.id(), "Stream disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drop the session and schedule exactly one reconnect.
    fn on_closed(&mut self) {
        self.conn = None;
        self.set_state(ConnectionState::Disconnected);

        if self.target.is_some() {
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
            self.stats.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
            debug!(delay_ms = self.config.reconnect_delay.as_millis() as u64, "Reconnect scheduled");
        }
    }

    async fn on_frame(&mut self, frame: Result<Option<String>, TransportError>) {
        let text = match frame {
            Ok(Some(text)) => text,
            Ok(None) => {
                info!("Stream closed");
                self.on_closed();
                return;
            }
            Err(e) => {
                warn!("Stream error: {}", e);
                self.on_closed();
                return;
            }
        };
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        match decode(&text) {
            Ok(Frame::Ping) => {
                let sent = match self.conn.as_mut() {
                    Some(conn) => conn.send_text(PONG.to_string()).await,
                    None => Err(TransportError::ConnectionClosed),
                };
                if let Err(e) = sent {
                    warn!("Keepalive reply failed: {}", e);
                    self.on_closed();
                }
            }
            Ok(Frame::Pong) => trace!("Pong received"),
            Ok(Frame::Update(update)) => {
                trace!(topic = %update.topic, "Routing update");
                if self.sink.send(M::from(update)).await.is_err() {
                    warn!("Update sink closed; dropping update");
                }
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping undecodable frame: {}", e);
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }
}

/// How an open attempt ended.
enum Opening {
    Finished(Result<Result<Box<dyn Connection>, TransportError>, tokio::time::error::Elapsed>),
    Aborted(oneshot::Sender<()>),
    Stopped,
}

async fn recv_frame(
    conn: &mut Option<Box<dyn Connection>>,
) -> Result<Option<String>, TransportError> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
