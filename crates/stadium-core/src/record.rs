//! Device and relay records.
//!
//! Records are sparse: every field is optional because the stream delivers
//! partial patches. A record is built up over time by [`DeviceRecord::merge`]
//! and [`RelayRecord::merge`], which only ever overwrite the fields a patch
//! carries. Keys the backend sends that have no typed field are kept in
//! `extra` so nothing the server said is lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::timestamp;

/// Overwrite `slot` only when the patch carries a value.
fn overwrite<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Merge untyped fields, ignoring explicit nulls.
fn merge_extra(into: &mut Map<String, Value>, from: Map<String, Value>) {
    into.extend(from.into_iter().filter(|(_, v)| !v.is_null()));
}

/// The last known state of one device.
///
/// The same type doubles as the patch shape: a patch is a record holding
/// only the fields that changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Human-readable device name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Whether the device is currently reachable over WiFi.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_connected: Option<bool>,

    /// Battery charge in percent.
    #[serde(default, rename = "batteryCharge", skip_serializing_if = "Option::is_none")]
    pub battery_charge_percent: Option<f64>,

    /// Board temperature in degrees Celsius.
    #[serde(default, rename = "temperature", skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,

    /// Firmware version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,

    /// Over-the-air update status.
    #[serde(
        default,
        rename = "otaStatus",
        alias = "otaUpdateStatus",
        skip_serializing_if = "Option::is_none"
    )]
    pub ota_update_status: Option<String>,

    /// When the backend last heard from the device.
    #[serde(
        default,
        deserialize_with = "timestamp::deserialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_time: Option<DateTime<Utc>>,

    /// When the backend first saw the device.
    #[serde(
        default,
        deserialize_with = "timestamp::deserialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub first_seen: Option<DateTime<Utc>>,

    /// Round-trip latency in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,

    /// Site (stadium slug) the device belongs to.
    #[serde(default, rename = "stadium", skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,

    /// Fields without a typed counterpart.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceRecord {
    /// Decode a patch from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if a typed field has the wrong JSON type.
    pub fn from_patch(message: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(message))
    }

    /// Shallow field-wise merge: fields present in `patch` win, all others
    /// are retained.
    pub fn merge(&mut self, patch: DeviceRecord) {
        overwrite(&mut self.name, patch.name);
        overwrite(&mut self.wifi_connected, patch.wifi_connected);
        overwrite(&mut self.battery_charge_percent, patch.battery_charge_percent);
        overwrite(&mut self.temperature_celsius, patch.temperature_celsius);
        overwrite(&mut self.firmware_version, patch.firmware_version);
        overwrite(&mut self.ota_update_status, patch.ota_update_status);
        overwrite(&mut self.last_message_time, patch.last_message_time);
        overwrite(&mut self.first_seen, patch.first_seen);
        overwrite(&mut self.latency_ms, patch.latency_ms);
        overwrite(&mut self.site, patch.site);
        merge_extra(&mut self.extra, patch.extra);
    }

    /// Return a copy of `self` with `patch` merged in.
    #[must_use]
    pub fn merged(&self, patch: DeviceRecord) -> Self {
        let mut next = self.clone();
        next.merge(patch);
        next
    }

    /// The name to show for this device, falling back to its key.
    #[must_use]
    pub fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(key)
    }

    /// Whether the device reports itself online.
    ///
    /// Unknown connectivity counts as offline.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.wifi_connected == Some(true)
    }
}

/// The last known state of one relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    /// Server-asserted liveness; `None` means derive locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,

    /// Last heartbeat seen by the backend.
    #[serde(
        default,
        rename = "last_seen",
        alias = "lastSeen",
        deserialize_with = "timestamp::deserialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_seen: Option<DateTime<Utc>>,

    /// Fields without a typed counterpart.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelayRecord {
    /// Decode a patch from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if a typed field has the wrong JSON type.
    pub fn from_patch(message: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(message))
    }

    /// Shallow field-wise merge, same rule as [`DeviceRecord::merge`].
    pub fn merge(&mut self, patch: RelayRecord) {
        overwrite(&mut self.alive, patch.alive);
        overwrite(&mut self.last_seen, patch.last_seen);
        merge_extra(&mut self.extra, patch.extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device(value: Value) -> DeviceRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_device_wire_names() {
        let record = device(json!({
            "name": "North Gate",
            "wifiConnected": true,
            "batteryCharge": 81.5,
            "temperature": 29.0,
            "firmwareVersion": "1.4.2",
            "otaStatus": "idle",
            "lastMessageTime": "2025-05-01T18:22:10.123456",
            "firstSeen": "2025-04-01T08:00:00Z",
            "latencyMs": 42.0,
            "stadium": "anfield"
        }));

        assert_eq!(record.name.as_deref(), Some("North Gate"));
        assert_eq!(record.wifi_connected, Some(true));
        assert_eq!(record.battery_charge_percent, Some(81.5));
        assert_eq!(record.temperature_celsius, Some(29.0));
        assert_eq!(record.ota_update_status.as_deref(), Some("idle"));
        assert!(record.last_message_time.is_some());
        assert!(record.first_seen.is_some());
        assert_eq!(record.site.as_deref(), Some("anfield"));
        assert!(record.extra.is_empty());
    }

    #[test]
    fn test_ota_alias() {
        let record = device(json!({"otaUpdateStatus": "downloading"}));
        assert_eq!(record.ota_update_status.as_deref(), Some("downloading"));
    }

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let mut record = device(json!({"name": "A", "wifiConnected": true, "batteryCharge": 90.0}));
        record.merge(device(json!({"batteryCharge": 75.0})));

        assert_eq!(record.name.as_deref(), Some("A"));
        assert_eq!(record.wifi_connected, Some(true));
        assert_eq!(record.battery_charge_percent, Some(75.0));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = device(json!({"name": "A", "temperature": 20.0, "rssi": -60}));
        let patch = device(json!({"wifiConnected": false, "temperature": 35.5, "mode": "eco"}));

        let once = base.merged(patch.clone());
        let twice = once.merged(patch);
        assert_eq!(once, twice);
        assert_eq!(twice.name.as_deref(), Some("A"));
        assert_eq!(twice.extra.get("rssi"), Some(&json!(-60)));
        assert_eq!(twice.extra.get("mode"), Some(&json!("eco")));
    }

    #[test]
    fn test_null_does_not_clear() {
        let mut record = device(json!({"latencyMs": 12.0, "stadium": "anfield", "note": "x"}));
        record.merge(device(json!({"latencyMs": null, "stadium": null, "note": null})));

        assert_eq!(record.latency_ms, Some(12.0));
        assert_eq!(record.site.as_deref(), Some("anfield"));
        assert_eq!(record.extra.get("note"), Some(&json!("x")));
    }

    #[test]
    fn test_patch_type_mismatch_is_error() {
        let mut message = Map::new();
        message.insert("wifiConnected".into(), json!("yes"));
        assert!(DeviceRecord::from_patch(message).is_err());
    }

    #[test]
    fn test_display_name_falls_back_to_key() {
        let record = DeviceRecord::default();
        assert_eq!(record.display_name("fov-01"), "fov-01");
        assert!(!record.is_online());
    }

    #[test]
    fn test_relay_merge() {
        let mut relay: RelayRecord =
            serde_json::from_value(json!({"last_seen": "2025-05-01T18:22:10Z"})).unwrap();
        assert_eq!(relay.alive, None);

        relay.merge(serde_json::from_value(json!({"alive": true})).unwrap());
        assert_eq!(relay.alive, Some(true));
        assert!(relay.last_seen.is_some());

        let camel: RelayRecord =
            serde_json::from_value(json!({"lastSeen": "2025-05-01T18:22:10Z"})).unwrap();
        assert_eq!(camel.last_seen, relay.last_seen);
    }
}
