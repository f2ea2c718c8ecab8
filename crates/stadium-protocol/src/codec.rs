//! Codec for encoding and decoding stream frames.
//!
//! Frames are plain text. Keepalive frames are matched literally, every
//! other frame is a JSON envelope whose topic is resolved into a [`Topic`].

use serde_json::Value;
use thiserror::Error;

use crate::frames::{Envelope, Frame, Topic, Update, PING, PONG, RELAY_PREFIX};

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or not an envelope.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope's message is not a JSON object.
    #[error("Message for topic {0} is not an object")]
    NotAnObject(String),

    /// The envelope's topic is empty.
    #[error("Empty topic")]
    EmptyTopic,

    /// A relay topic without a key.
    #[error("Relay topic without key")]
    EmptyRelayKey,
}

/// Resolve a wire topic into a [`Topic`].
///
/// Topics beginning with `relay:` address the relay named by everything
/// after the prefix; any other topic is a device key.
///
/// # Errors
///
/// Returns an error if the topic or the relay key is empty.
pub fn parse_topic(topic: &str) -> Result<Topic, ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::EmptyTopic);
    }

    match topic.strip_prefix(RELAY_PREFIX) {
        Some("") => Err(ProtocolError::EmptyRelayKey),
        Some(key) => Ok(Topic::Relay(key.to_string())),
        None => Ok(Topic::Device(topic.to_string())),
    }
}

/// Decode a text frame.
///
/// # Errors
///
/// Returns an error if the frame is neither a keepalive literal nor a
/// well-formed envelope with an object message.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    match text {
        PING => return Ok(Frame::Ping),
        PONG => return Ok(Frame::Pong),
        _ => {}
    }

    let envelope: Envelope = serde_json::from_str(text)?;
    let topic = parse_topic(&envelope.topic)?;

    match envelope.message {
        Value::Object(message) => Ok(Frame::Update(Update { topic, message })),
        _ => Err(ProtocolError::NotAnObject(envelope.topic)),
    }
}

/// Encode a frame to its text form.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    match frame {
        Frame::Ping => Ok(PING.to_string()),
        Frame::Pong => Ok(PONG.to_string()),
        Frame::Update(update) => {
            let envelope = Envelope {
                topic: update.topic.to_string(),
                message: Value::Object(update.message.clone()),
            };
            Ok(serde_json::to_string(&envelope)?)
        }
    }
}
