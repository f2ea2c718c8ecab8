//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use stadium_core::{AlertEvent, Fleet, RetireReason, StateSnapshot};
use stadium_transport::{ConnectionState, StatsSnapshot};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTION_STATE: &str = "stadium_connection_state";
    pub const CONNECT_ATTEMPTS: &str = "stadium_connect_attempts_total";
    pub const RECONNECTS: &str = "stadium_reconnects_total";
    pub const FRAMES: &str = "stadium_frames_total";
    pub const DECODE_ERRORS: &str = "stadium_decode_errors_total";
    pub const ALERTS_RAISED: &str = "stadium_alerts_raised_total";
    pub const ALERTS_RETIRED: &str = "stadium_alerts_retired_total";
    pub const ALERTS_ACTIVE: &str = "stadium_alerts_active";
    pub const DEVICES: &str = "stadium_devices";
    pub const RELAYS_ALIVE: &str = "stadium_relays_alive";
    pub const REJECTED_PATCHES: &str = "stadium_rejected_patches_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_gauge!(
        names::CONNECTION_STATE,
        "Stream state: 0 disconnected, 1 connecting, 2 connected"
    );
    metrics::describe_counter!(names::CONNECT_ATTEMPTS, "Stream open attempts");
    metrics::describe_counter!(names::RECONNECTS, "Reconnects scheduled after a close");
    metrics::describe_counter!(names::FRAMES, "Text frames received on the stream");
    metrics::describe_counter!(names::DECODE_ERRORS, "Frames dropped on decode");
    metrics::describe_counter!(names::ALERTS_RAISED, "Offline alerts raised");
    metrics::describe_counter!(names::ALERTS_RETIRED, "Offline alerts retired");
    metrics::describe_gauge!(names::ALERTS_ACTIVE, "Currently active offline alerts");
    metrics::describe_gauge!(names::DEVICES, "Known devices by connectivity");
    metrics::describe_gauge!(names::RELAYS_ALIVE, "Relays currently estimated alive");
    metrics::describe_counter!(names::REJECTED_PATCHES, "Patches that failed to decode");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn state_value(state: ConnectionState) -> f64 {
    match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
    }
}

/// Record a stream state change.
pub fn record_connection_state(state: ConnectionState) {
    gauge!(names::CONNECTION_STATE).set(state_value(state));
}

/// Publish the connection manager's counters.
pub fn record_manager_stats(stats: &StatsSnapshot) {
    counter!(names::CONNECT_ATTEMPTS).absolute(stats.connect_attempts);
    counter!(names::RECONNECTS).absolute(stats.reconnects_scheduled);
    counter!(names::FRAMES).absolute(stats.frames_received);
    counter!(names::DECODE_ERRORS).absolute(stats.decode_errors);
}

/// Record an alert transition.
pub fn record_alert(event: &AlertEvent) {
    match event {
        AlertEvent::Raised(_) => counter!(names::ALERTS_RAISED).increment(1),
        AlertEvent::Retired { reason, .. } => {
            let reason = match reason {
                RetireReason::CameOnline => "came_online",
                RetireReason::Expired => "expired",
            };
            counter!(names::ALERTS_RETIRED, "reason" => reason).increment(1);
        }
    }
}

/// Publish fleet gauges from a committed snapshot.
pub fn record_snapshot(snapshot: &StateSnapshot, liveness_timeout: Duration) {
    let counts = snapshot.fleet.device_counts();
    gauge!(names::DEVICES, "status" => "online").set(counts.online as f64);
    gauge!(names::DEVICES, "status" => "offline").set(counts.offline as f64);
    gauge!(names::ALERTS_ACTIVE).set(snapshot.alerts.len() as f64);
    counter!(names::REJECTED_PATCHES).absolute(snapshot.stats.rejected_patches);
    record_relay_liveness(&snapshot.fleet, Utc::now(), liveness_timeout);
}

/// Publish how many relays are alive at `now`.
///
/// Heartbeats go stale without any new patch, so this also runs on a timer.
pub fn record_relay_liveness(
    fleet: &Fleet,
    now: DateTime<Utc>,
    liveness_timeout: Duration,
) -> usize {
    let alive = fleet
        .relays(now, liveness_timeout)
        .iter()
        .filter(|relay| relay.alive)
        .count();
    gauge!(names::RELAYS_ALIVE).set(alive as f64);
    alive
}
