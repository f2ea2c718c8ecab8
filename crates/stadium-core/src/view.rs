//! Read-only views over the fleet.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::liveness::is_alive_within;
use crate::record::{DeviceRecord, RelayRecord};

/// Connectivity filter for device listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceFilter {
    /// Every device.
    #[default]
    All,
    /// Devices reporting `wifiConnected == true`.
    Online,
    /// Every other device.
    Offline,
}

impl DeviceFilter {
    /// Check if a record passes this filter.
    #[must_use]
    pub fn matches(self, record: &DeviceRecord) -> bool {
        match self {
            DeviceFilter::All => true,
            DeviceFilter::Online => record.is_online(),
            DeviceFilter::Offline => !record.is_online(),
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceFilter::All => "all",
            DeviceFilter::Online => "online",
            DeviceFilter::Offline => "offline",
        })
    }
}

impl FromStr for DeviceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(DeviceFilter::All),
            "online" => Ok(DeviceFilter::Online),
            "offline" => Ok(DeviceFilter::Offline),
            other => Err(format!("unknown device filter: {other}")),
        }
    }
}

/// Device totals per filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounts {
    /// All devices.
    pub all: usize,
    /// Online devices.
    pub online: usize,
    /// Offline devices.
    pub offline: usize,
}

/// Derived liveness of one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    /// Relay key.
    pub key: String,
    /// Estimated liveness.
    pub alive: bool,
    /// Last heartbeat, if ever seen.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Check if `record` matches a lowercase, trimmed search needle.
fn matches_search(record: &DeviceRecord, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }

    let haystack = [
        record.name.as_deref().unwrap_or(""),
        record.site.as_deref().unwrap_or(""),
        record.firmware_version.as_deref().unwrap_or(""),
    ]
    .map(str::to_lowercase)
    .join(" ");

    haystack.contains(needle)
}

/// The device and relay maps.
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    pub(crate) devices: HashMap<String, DeviceRecord>,
    pub(crate) relays: HashMap<String, RelayRecord>,
}

impl Fleet {
    /// Get a device record.
    #[must_use]
    pub fn device(&self, key: &str) -> Option<&DeviceRecord> {
        self.devices.get(key)
    }

    /// Get a relay record.
    #[must_use]
    pub fn relay(&self, key: &str) -> Option<&RelayRecord> {
        self.relays.get(key)
    }

    /// Number of known devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of known relays.
    #[must_use]
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// List devices.
    ///
    /// `search` is matched case-insensitively against name, site and
    /// firmware version; an empty search matches everything. Results are
    /// ordered by device key.
    #[must_use]
    pub fn list_devices(
        &self,
        filter: DeviceFilter,
        search: &str,
        ascending: bool,
    ) -> Vec<(&str, &DeviceRecord)> {
        let needle = search.trim().to_lowercase();

        let mut devices: Vec<(&str, &DeviceRecord)> = self
            .devices
            .iter()
            .filter(|(_, record)| filter.matches(record))
            .filter(|(_, record)| matches_search(record, &needle))
            .map(|(key, record)| (key.as_str(), record))
            .collect();

        if ascending {
            devices.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        } else {
            devices.sort_unstable_by(|(a, _), (b, _)| b.cmp(a));
        }
        devices
    }

    /// Count devices per filter.
    #[must_use]
    pub fn device_counts(&self) -> DeviceCounts {
        let online = self.devices.values().filter(|d| d.is_online()).count();
        DeviceCounts {
            all: self.devices.len(),
            online,
            offline: self.devices.len() - online,
        }
    }

    /// Derived liveness of one relay.
    #[must_use]
    pub fn relay_status(&self, key: &str, now: DateTime<Utc>, timeout: Duration) -> Option<RelayStatus> {
        self.relays.get(key).map(|relay| RelayStatus {
            key: key.to_string(),
            alive: is_alive_within(relay.alive, relay.last_seen, now, timeout),
            last_seen: relay.last_seen,
        })
    }

    /// Derived liveness of every relay, ordered by key.
    #[must_use]
    pub fn relays(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<RelayStatus> {
        let mut statuses: Vec<RelayStatus> = self
            .relays
            .keys()
            .filter_map(|key| self.relay_status(key, now, timeout))
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }
}

/// Metadata for one site, as served by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteMeta {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Site slug to display name mapping.
#[derive(Debug, Clone, Default)]
pub struct SiteLabels {
    labels: HashMap<String, String>,
}

impl SiteLabels {
    /// Create an empty mapping; every lookup falls back to the slug.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the mapping from backend metadata.
    #[must_use]
    pub fn from_meta(meta: HashMap<String, SiteMeta>) -> Self {
        let labels = meta
            .into_iter()
            .map(|(slug, info)| {
                let name = info.name.unwrap_or_else(|| slug.clone());
                (slug, name)
            })
            .collect();
        Self { labels }
    }

    /// Display name for `slug`, or the slug itself when unknown.
    #[must_use]
    pub fn label<'a>(&'a self, slug: &'a str) -> &'a str {
        self.labels.get(slug).map(String::as_str).unwrap_or(slug)
    }

    /// Number of known sites.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if no sites are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
