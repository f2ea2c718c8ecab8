//! State reconciler.
//!
//! Applies device and relay patches to the [`Fleet`], detects connectivity
//! edges and drives the [`Notifier`] with them.

use std::collections::HashMap;
use stadium_protocol::{Topic, Update};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::notifier::{AlertEvent, Notifier};
use crate::record::{DeviceRecord, RelayRecord};
use crate::view::Fleet;

/// Reconciler errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A patch could not be decoded into a record.
    #[error("Invalid patch for {topic}: {source}")]
    InvalidPatch {
        /// Topic the patch arrived on.
        topic: String,
        /// Decode failure.
        #[source]
        source: serde_json::Error,
    },
}

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// `wifiConnected` went from `true` to `false`.
    WentOffline,
    /// `wifiConnected` went from `false` to `true`.
    CameOnline,
}

/// Compare connectivity before and after a merge.
///
/// Only a known value changing to the opposite known value is an edge;
/// an unknown value on either side never is.
#[must_use]
pub fn detect_edge(prev: Option<bool>, next: Option<bool>) -> Option<Edge> {
    match (prev, next) {
        (Some(true), Some(false)) => Some(Edge::WentOffline),
        (Some(false), Some(true)) => Some(Edge::CameOnline),
        _ => None,
    }
}

/// Reconciler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    /// Device patches applied.
    pub device_patches: u64,
    /// Relay patches applied.
    pub relay_patches: u64,
    /// Patches dropped because they failed to decode.
    pub rejected_patches: u64,
}

/// Owner of the fleet maps and the alert register.
#[derive(Debug, Default)]
pub struct Reconciler {
    fleet: Fleet,
    notifier: Notifier,
    revision: u64,
    stats: ReconcilerStats,
}

impl Reconciler {
    /// Create an empty reconciler.
    #[must_use]
    pub fn new(notifier: Notifier) -> Self {
        Self {
            fleet: Fleet::default(),
            notifier,
            revision: 0,
            stats: ReconcilerStats::default(),
        }
    }

    /// Merge a device patch and forward any edge to the notifier.
    pub fn apply_device_patch(
        &mut self,
        key: &str,
        patch: DeviceRecord,
        now: Instant,
    ) -> Option<AlertEvent> {
        let prev = self
            .fleet
            .devices
            .get(key)
            .and_then(|record| record.wifi_connected);

        let record = self.fleet.devices.entry(key.to_string()).or_default();
        record.merge(patch);
        let edge = detect_edge(prev, record.wifi_connected);
        let display_name = record.display_name(key).to_string();

        self.revision += 1;
        self.stats.device_patches += 1;
        trace!(device = %key, revision = self.revision, "Device patch applied");

        match edge? {
            Edge::WentOffline => {
                debug!(device = %key, "Device went offline");
                self.notifier.on_went_offline(key, &display_name, now)
            }
            Edge::CameOnline => {
                debug!(device = %key, "Device came online");
                self.notifier.on_came_online(key)
            }
        }
    }

    /// Merge a relay patch.
    pub fn apply_relay_patch(&mut self, key: &str, patch: RelayRecord) {
        self.fleet
            .relays
            .entry(key.to_string())
            .or_default()
            .merge(patch);

        self.revision += 1;
        self.stats.relay_patches += 1;
        trace!(relay = %key, revision = self.revision, "Relay patch applied");
    }

    /// Route a decoded stream update to the matching entry point.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not decode into a patch; no
    /// record is created or changed in that case.
    pub fn apply_update(
        &mut self,
        update: Update,
        now: Instant,
    ) -> Result<Option<AlertEvent>, ReconcileError> {
        let topic = update.topic.to_string();
        let invalid = |source| ReconcileError::InvalidPatch {
            topic: topic.clone(),
            source,
        };

        let result = match update.topic {
            Topic::Device(key) => DeviceRecord::from_patch(update.message)
                .map_err(invalid)
                .map(|patch| self.apply_device_patch(&key, patch, now)),
            Topic::Relay(key) => RelayRecord::from_patch(update.message)
                .map_err(invalid)
                .map(|patch| {
                    self.apply_relay_patch(&key, patch);
                    None
                }),
        };

        if let Err(e) = &result {
            self.stats.rejected_patches += 1;
            warn!(error = %e, "Dropping patch");
        }
        result
    }

    /// Merge a bulk device load without edge detection.
    pub fn seed_devices(&mut self, devices: HashMap<String, DeviceRecord>) {
        let count = devices.len();
        for (key, patch) in devices {
            self.fleet.devices.entry(key).or_default().merge(patch);
        }
        self.revision += 1;
        debug!(count, "Seeded devices");
    }

    /// Merge a bulk relay load.
    pub fn seed_relays(&mut self, relays: HashMap<String, RelayRecord>) {
        let count = relays.len();
        for (key, patch) in relays {
            self.fleet.relays.entry(key).or_default().merge(patch);
        }
        self.revision += 1;
        debug!(count, "Seeded relays");
    }

    /// Retire alerts whose deadline has passed.
    pub fn expire_alerts(&mut self, now: Instant) -> Vec<AlertEvent> {
        let expired = self.notifier.expire_due(now);
        if !expired.is_empty() {
            self.revision += 1;
        }
        expired
    }

    /// The earliest alert deadline.
    #[must_use]
    pub fn next_alert_deadline(&self) -> Option<Instant> {
        self.notifier.next_deadline()
    }

    /// Current fleet state.
    #[must_use]
    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// Current alert register.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Number of committed mutations so far.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::RetireReason;
    use crate::view::DeviceFilter;
    use serde_json::{json, Value};
    use stadium_protocol::{decode, Frame};

    fn patch(value: Value) -> DeviceRecord {
        serde_json::from_value(value).unwrap()
    }

    fn update(raw: &str) -> Update {
        match decode(raw).unwrap() {
            Frame::Update(update) => update,
            other => panic!("Expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_detect_edge() {
        assert_eq!(detect_edge(Some(true), Some(false)), Some(Edge::WentOffline));
        assert_eq!(detect_edge(Some(false), Some(true)), Some(Edge::CameOnline));
        assert_eq!(detect_edge(None, Some(false)), None);
        assert_eq!(detect_edge(None, Some(true)), None);
        assert_eq!(detect_edge(Some(true), Some(true)), None);
        assert_eq!(detect_edge(Some(false), None), None);
    }

    #[test]
    fn test_relay_routing() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();

        let event = reconciler
            .apply_update(update(r#"{"topic":"relay:r1","message":{"alive":true}}"#), now)
            .unwrap();

        assert!(event.is_none());
        assert_eq!(reconciler.fleet().relay("r1").unwrap().alive, Some(true));
        assert!(reconciler.fleet().device("relay:r1").is_none());
        assert!(reconciler.fleet().device("r1").is_none());
        assert_eq!(reconciler.fleet().device_count(), 0);
    }

    #[test]
    fn test_first_patch_is_not_an_edge() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();

        assert!(reconciler
            .apply_device_patch("A", patch(json!({"wifiConnected": false})), now)
            .is_none());
        assert_eq!(reconciler.notifier().active_count(), 0);
    }

    #[test]
    fn test_at_most_one_alert() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();

        reconciler.apply_device_patch("A", patch(json!({"name": "Gate A", "wifiConnected": true})), now);
        let raised = reconciler.apply_device_patch("A", patch(json!({"wifiConnected": false})), now);
        match raised {
            Some(AlertEvent::Raised(handle)) => assert_eq!(handle.message(), "Gate A went offline"),
            other => panic!("Expected raise, got {:?}", other),
        }

        // Repeated offline reports are not edges.
        for _ in 0..3 {
            assert!(reconciler
                .apply_device_patch("A", patch(json!({"wifiConnected": false})), now)
                .is_none());
        }
        assert_eq!(reconciler.notifier().active_count(), 1);
    }

    #[test]
    fn test_came_online_cancels_alert() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();

        reconciler.apply_device_patch("A", patch(json!({"wifiConnected": true})), now);
        reconciler.apply_device_patch("A", patch(json!({"wifiConnected": false})), now);
        let retired = reconciler.apply_device_patch("A", patch(json!({"wifiConnected": true})), now);

        assert!(matches!(
            retired,
            Some(AlertEvent::Retired { reason: RetireReason::CameOnline, .. })
        ));
        assert!(reconciler.next_alert_deadline().is_none());
        assert!(reconciler
            .expire_alerts(now + crate::notifier::ALERT_AUTO_EXPIRE)
            .is_empty());
    }

    #[test]
    fn test_display_name_falls_back_to_key() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();

        reconciler.apply_device_patch("fov-07", patch(json!({"wifiConnected": true})), now);
        let event = reconciler
            .apply_device_patch("fov-07", patch(json!({"wifiConnected": false})), now)
            .unwrap();
        assert_eq!(event.handle().display_name, "fov-07");
    }

    #[test]
    fn test_filter_and_search_scenario() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();

        reconciler.apply_update(update(r#"{"topic":"A","message":{"wifiConnected":true,"stadium":"siteX"}}"#), now).unwrap();
        reconciler.apply_update(update(r#"{"topic":"B","message":{"wifiConnected":false,"stadium":"siteY"}}"#), now).unwrap();

        let keys: Vec<&str> = reconciler
            .fleet()
            .list_devices(DeviceFilter::Online, "sitex", true)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["A"]);
    }

    #[test]
    fn test_invalid_patch_creates_nothing() {
        let mut reconciler = Reconciler::default();
        let result = reconciler.apply_update(
            update(r#"{"topic":"A","message":{"wifiConnected":"yes"}}"#),
            Instant::now(),
        );

        assert!(matches!(result, Err(ReconcileError::InvalidPatch { .. })));
        assert!(reconciler.fleet().device("A").is_none());
        assert_eq!(reconciler.stats().rejected_patches, 1);
        assert_eq!(reconciler.revision(), 0);
    }

    #[test]
    fn test_seed_has_no_edges() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        reconciler.apply_device_patch("A", patch(json!({"wifiConnected": true, "name": "Gate A"})), now);

        let mut bulk = HashMap::new();
        bulk.insert("A".to_string(), patch(json!({"wifiConnected": false})));
        bulk.insert("B".to_string(), patch(json!({"wifiConnected": true})));
        reconciler.seed_devices(bulk);

        assert_eq!(reconciler.notifier().active_count(), 0);
        let a = reconciler.fleet().device("A").unwrap();
        assert_eq!(a.wifi_connected, Some(false));
        assert_eq!(a.name.as_deref(), Some("Gate A"));
        assert_eq!(reconciler.fleet().device_count(), 2);
    }
}
