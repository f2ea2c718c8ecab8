//! Transport abstraction traits.
//!
//! The connection manager only needs to open a session and exchange text
//! frames, so any client transport that can do that plugs in behind these
//! traits.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identifier for one opened session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique session ID.
    #[must_use]
    pub fn generate() -> Self {
        let seq = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        Self(format!("session_{seq:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Opening the session failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The endpoint URL is malformed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<url::ParseError> for TransportError {
    fn from(e: url::ParseError) -> Self {
        TransportError::InvalidUrl(e.to_string())
    }
}

/// A client transport that can open sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// An open session.
///
/// Transport-level keepalive (e.g. WebSocket Ping frames) is handled
/// inside the implementation; only application text reaches the caller.
#[async_trait]
pub trait Connection: Send {
    /// Get the session's identifier.
    fn id(&self) -> &SessionId;

    /// Receive the next text frame.
    ///
    /// Returns `None` if the peer closed the session.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the session gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the session is still open.
    fn is_open(&self) -> bool;
}
