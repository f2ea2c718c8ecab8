//! Frame types for the stadium telemetry stream.
//!
//! The stream carries UTF-8 text frames. Two of them are literal keepalive
//! strings (`"ping"` / `"pong"`); everything else is a JSON envelope of the
//! shape `{"topic": string, "message": object}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Literal keepalive request sent by the server.
pub const PING: &str = "ping";

/// Literal keepalive reply.
pub const PONG: &str = "pong";

/// Reserved topic prefix for relay heartbeats.
pub const RELAY_PREFIX: &str = "relay:";

/// The addressed entity of an update.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A device, addressed by its bare key.
    Device(String),
    /// A relay, addressed as `relay:<key>` on the wire.
    Relay(String),
}

impl Topic {
    /// Get the entity key (without the relay prefix).
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Topic::Device(key) | Topic::Relay(key) => key,
        }
    }

    /// Check whether this topic addresses a relay.
    #[must_use]
    pub fn is_relay(&self) -> bool {
        matches!(self, Topic::Relay(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Device(key) => f.write_str(key),
            Topic::Relay(key) => write!(f, "{RELAY_PREFIX}{key}"),
        }
    }
}

/// The raw JSON envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing topic.
    pub topic: String,
    /// Patch body.
    pub message: Value,
}

/// A decoded, routed state patch.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Where the patch goes.
    pub topic: Topic,
    /// Field-wise patch for the addressed record.
    pub message: Map<String, Value>,
}

impl Update {
    /// Create a device update.
    #[must_use]
    pub fn device(key: impl Into<String>, message: Map<String, Value>) -> Self {
        Self {
            topic: Topic::Device(key.into()),
            message,
        }
    }

    /// Create a relay update.
    #[must_use]
    pub fn relay(key: impl Into<String>, message: Map<String, Value>) -> Self {
        Self {
            topic: Topic::Relay(key.into()),
            message,
        }
    }
}

/// A stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Keepalive request; must be answered with [`Frame::Pong`].
    Ping,
    /// Keepalive acknowledgment.
    Pong,
    /// State patch for a device or relay.
    Update(Update),
}

impl Frame {
    /// Check if this is a keepalive control frame.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Ping | Frame::Pong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_display() {
        assert_eq!(Topic::Device("fov-01".into()).to_string(), "fov-01");
        assert_eq!(Topic::Relay("r1".into()).to_string(), "relay:r1");
    }

    #[test]
    fn test_topic_key() {
        let topic = Topic::Relay("championdata".into());
        assert_eq!(topic.key(), "championdata");
        assert!(topic.is_relay());
        assert!(!Topic::Device("a".into()).is_relay());
    }

    #[test]
    fn test_control_frames() {
        assert!(Frame::Ping.is_control());
        assert!(Frame::Pong.is_control());
        assert!(!Frame::Update(Update::device("a", Map::new())).is_control());
    }
}
