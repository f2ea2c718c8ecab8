//! Liveness estimation for relays and other heartbeat-driven entities.
//!
//! The server's `alive` flag is authoritative whenever it is present. Right
//! after a reconnect the flag may not have arrived yet, so a locally derived
//! staleness check on `last_seen` stands in for it instead of reporting the
//! entity offline.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Heartbeat staleness window, kept in sync with the backend's grace period.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_millis(90_000);

/// Estimate liveness with the default [`LIVENESS_TIMEOUT`].
#[must_use]
pub fn is_alive(
    server_alive: Option<bool>,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    is_alive_within(server_alive, last_seen, now, LIVENESS_TIMEOUT)
}

/// Estimate liveness.
///
/// 1. A server-asserted flag is returned verbatim.
/// 2. Otherwise the entity is alive if it was seen less than `timeout` ago.
/// 3. With neither, it is dead.
#[must_use]
pub fn is_alive_within(
    server_alive: Option<bool>,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    if let Some(alive) = server_alive {
        return alive;
    }

    match last_seen {
        Some(seen) => {
            let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
            (now - seen).num_milliseconds() < timeout_ms
        }
        None => false,
    }
}
