//! # stadium-protocol
//!
//! Wire protocol definitions for the stadium telemetry stream.
//!
//! The stream is a sequence of text frames:
//!
//! - `"ping"` / `"pong"` - Keepalive literals
//! - `{"topic": "<device>", "message": {...}}` - Device patch
//! - `{"topic": "relay:<relay>", "message": {...}}` - Relay patch
//!
//! ## Example
//!
//! ```rust
//! use stadium_protocol::{codec, Frame, Topic};
//!
//! let frame = codec::decode(r#"{"topic":"relay:r1","message":{"alive":true}}"#).unwrap();
//! match frame {
//!     Frame::Update(update) => assert_eq!(update.topic, Topic::Relay("r1".into())),
//!     _ => unreachable!(),
//! }
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, parse_topic, ProtocolError};
pub use frames::{Envelope, Frame, Topic, Update, PING, PONG, RELAY_PREFIX};
