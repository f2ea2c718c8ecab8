//! Offline alerts, raised and retired on connectivity edges.
//!
//! The notifier is a register of at most one active alert per device key.
//! It does not poll: it only reacts to the edges the reconciler feeds it and
//! to the deadline the owning task sleeps on. Removing an alert from the
//! register removes its deadline, which is how an expiry is cancelled.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// How long an offline alert stays up without a came-online edge.
pub const ALERT_AUTO_EXPIRE: Duration = Duration::from_millis(300_000);

/// Upper bound on the auto-expiry; keeps `now + auto_expire` representable.
pub const MAX_AUTO_EXPIRE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A unique alert identifier.
pub type AlertId = u64;

/// A live offline alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertHandle {
    /// Unique identifier.
    pub id: AlertId,
    /// Device key the alert belongs to.
    pub key: String,
    /// Name shown to the user.
    pub display_name: String,
    /// When the alert was raised.
    pub raised_at: Instant,
    /// When the alert retires itself.
    pub expires_at: Instant,
}

impl AlertHandle {
    /// The user-facing alert text.
    #[must_use]
    pub fn message(&self) -> String {
        format!("{} went offline", self.display_name)
    }
}

/// Why an alert left the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// The device came back online.
    CameOnline,
    /// The auto-expiry elapsed.
    Expired,
}

/// A change to the alert register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    /// A new alert was raised.
    Raised(AlertHandle),
    /// An alert was retired.
    Retired {
        /// The retired alert.
        handle: AlertHandle,
        /// Why it was retired.
        reason: RetireReason,
    },
}

impl AlertEvent {
    /// The alert this event is about.
    #[must_use]
    pub fn handle(&self) -> &AlertHandle {
        match self {
            AlertEvent::Raised(handle) | AlertEvent::Retired { handle, .. } => handle,
        }
    }
}

/// Register of active offline alerts.
#[derive(Debug)]
pub struct Notifier {
    active: HashMap<String, AlertHandle>,
    auto_expire: Duration,
    next_id: AlertId,
}

impl Notifier {
    /// Create a notifier with the default auto-expiry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_auto_expire(ALERT_AUTO_EXPIRE)
    }

    /// Create a notifier with a custom auto-expiry, capped at
    /// [`MAX_AUTO_EXPIRE`].
    #[must_use]
    pub fn with_auto_expire(auto_expire: Duration) -> Self {
        Self {
            active: HashMap::new(),
            auto_expire: auto_expire.min(MAX_AUTO_EXPIRE),
            next_id: 1,
        }
    }

    /// Handle a went-offline edge.
    ///
    /// Raises an alert unless one is already active for `key`.
    pub fn on_went_offline(
        &mut self,
        key: &str,
        display_name: &str,
        now: Instant,
    ) -> Option<AlertEvent> {
        if self.active.contains_key(key) {
            debug!(device = %key, "Offline alert already active");
            return None;
        }

        let handle = AlertHandle {
            id: self.next_id,
            key: key.to_string(),
            display_name: display_name.to_string(),
            raised_at: now,
            expires_at: now + self.auto_expire,
        };
        self.next_id += 1;
        self.active.insert(key.to_string(), handle.clone());

        info!(device = %key, alert = handle.id, "{}", handle.message());
        Some(AlertEvent::Raised(handle))
    }

    /// Handle a came-online edge.
    ///
    /// Retires the active alert for `key`, if any.
    pub fn on_came_online(&mut self, key: &str) -> Option<AlertEvent> {
        let handle = self.active.remove(key)?;
        info!(device = %key, alert = handle.id, "Offline alert cleared");
        Some(AlertEvent::Retired {
            handle,
            reason: RetireReason::CameOnline,
        })
    }

    /// The earliest pending expiry, if any alert is active.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.values().map(|h| h.expires_at).min()
    }

    /// Retire every alert whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<AlertEvent> {
        let due: Vec<String> = self
            .active
            .iter()
            .filter(|(_, handle)| handle.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| self.active.remove(&key))
            .map(|handle| {
                debug!(device = %handle.key, alert = handle.id, "Offline alert expired");
                AlertEvent::Retired {
                    handle,
                    reason: RetireReason::Expired,
                }
            })
            .collect()
    }

    /// Check if an alert is active for `key`.
    #[must_use]
    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains_key(key)
    }

    /// Get the active alert for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AlertHandle> {
        self.active.get(key)
    }

    /// Number of active alerts.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// All active alerts, ordered by device key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AlertHandle> {
        let mut handles: Vec<AlertHandle> = self.active.values().cloned().collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key));
        handles
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_is_idempotent() {
        let mut notifier = Notifier::new();
        let now = Instant::now();

        assert!(matches!(
            notifier.on_went_offline("fov-01", "North Gate", now),
            Some(AlertEvent::Raised(_))
        ));
        assert!(notifier.on_went_offline("fov-01", "North Gate", now).is_none());
        assert!(notifier.on_went_offline("fov-01", "North Gate", now).is_none());

        assert_eq!(notifier.active_count(), 1);
        assert_eq!(notifier.get("fov-01").unwrap().id, 1);
    }

    #[test]
    fn test_huge_auto_expire_is_capped() {
        let mut notifier = Notifier::with_auto_expire(Duration::MAX);
        let now = Instant::now();

        assert!(notifier.on_went_offline("fov-01", "North Gate", now).is_some());
        assert_eq!(notifier.next_deadline(), Some(now + MAX_AUTO_EXPIRE));
        assert!(notifier.expire_due(now + Duration::from_secs(86_400)).is_empty());
    }

    #[test]
    fn test_same_name_different_keys() {
        let mut notifier = Notifier::new();
        let now = Instant::now();

        notifier.on_went_offline("fov-01", "Gate", now);
        notifier.on_went_offline("fov-02", "Gate", now);
        assert_eq!(notifier.active_count(), 2);
    }

    #[test]
    fn test_came_online_retires() {
        let mut notifier = Notifier::new();
        notifier.on_went_offline("fov-01", "North Gate", Instant::now());

        match notifier.on_came_online("fov-01") {
            Some(AlertEvent::Retired { handle, reason }) => {
                assert_eq!(handle.key, "fov-01");
                assert_eq!(reason, RetireReason::CameOnline);
            }
            other => panic!("Expected retirement, got {:?}", other),
        }
        assert!(!notifier.is_active("fov-01"));
        assert!(notifier.next_deadline().is_none());
    }

    #[test]
    fn test_came_online_without_alert_is_noop() {
        let mut notifier = Notifier::new();
        assert!(notifier.on_came_online("fov-01").is_none());
        assert_eq!(notifier.active_count(), 0);
    }

    #[test]
    fn test_expiry() {
        let mut notifier = Notifier::with_auto_expire(Duration::from_secs(10));
        let start = Instant::now();

        notifier.on_went_offline("a", "A", start);
        notifier.on_went_offline("b", "B", start + Duration::from_secs(5));
        assert_eq!(notifier.next_deadline(), Some(start + Duration::from_secs(10)));

        assert!(notifier.expire_due(start + Duration::from_secs(9)).is_empty());

        let expired = notifier.expire_due(start + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].handle().key, "a");
        assert!(matches!(
            expired[0],
            AlertEvent::Retired { reason: RetireReason::Expired, .. }
        ));

        // An expired key can raise a fresh alert.
        let fresh = notifier.on_went_offline("a", "A", start + Duration::from_secs(11));
        assert!(matches!(fresh, Some(AlertEvent::Raised(ref h)) if h.id == 3));
    }

    #[test]
    fn test_retired_alert_never_expires() {
        let mut notifier = Notifier::with_auto_expire(Duration::from_secs(10));
        let start = Instant::now();

        notifier.on_went_offline("a", "A", start);
        notifier.on_came_online("a");
        assert!(notifier.expire_due(start + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_message() {
        let mut notifier = Notifier::new();
        let event = notifier.on_went_offline("fov-01", "North Gate", Instant::now()).unwrap();
        assert_eq!(event.handle().message(), "North Gate went offline");
    }
}
