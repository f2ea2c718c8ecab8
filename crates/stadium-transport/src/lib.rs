//! # stadium-transport
//!
//! Streaming connection layer for the stadium telemetry client.
//!
//! - **Transport / Connection** - Client transport traits
//! - **WebSocket** - The tokio-tungstenite implementation
//! - **ConnectionManager** - Session lifecycle, keepalive replies, frame
//!   routing and fixed-delay reconnects
//!
//! ```rust,ignore
//! use stadium_transport::{ConnectionManager, ManagerConfig, WebSocketTransport};
//!
//! let (updates_tx, updates_rx) = tokio::sync::mpsc::channel(1024);
//! let (conn, _task) =
//!     ConnectionManager::spawn(WebSocketTransport::new(), updates_tx, ManagerConfig::default());
//! conn.connect("wss://api.example.com/ws", &token).await?;
//! ```

pub mod manager;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use manager::{
    build_stream_url, ConnectionHandle, ConnectionManager, ConnectionState, ManagerConfig,
    ManagerStats, StatsSnapshot, CONNECT_TIMEOUT, RECONNECT_DELAY,
};
pub use traits::{Connection, SessionId, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
