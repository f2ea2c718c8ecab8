//! Application wiring.
//!
//! Start-up order: REST client, site labels, bulk load, sync engine,
//! stream. The watch loop then runs until Ctrl-C or until the backend
//! rejects the session. Every reconnect re-seeds the fleet from REST in
//! the background, so a rejection can surface at any time.

use crate::api::{ApiClient, BulkState};
use crate::config::{Config, HistoryConfig};
use crate::metrics;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use stadium_core::{
    AlertEvent, CursorPager, EngineHandle, HistoryFeed, HistoryQuery, HistorySource, PagerError,
    SiteLabels, SyncEngine,
};
use stadium_transport::{ConnectionManager, ConnectionState, WebSocketTransport};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// How often manager counters and relay liveness are exported.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Run the live watch loop.
///
/// # Errors
///
/// Returns an error if start-up fails or the session is rejected during
/// the bulk load.
pub async fn run(config: Config) -> Result<()> {
    let token = config.token()?;
    let api = ApiClient::new(&config.api_base, token, config.http_timeout())
        .context("Failed to create REST client")?;
    let mut unauthorized = api.unauthorized_signal();

    let labels = api.site_labels().await;
    info!(sites = labels.len(), "Loaded site labels");

    let bulk = api.bulk_state().await.context("Session rejected during initial load")?;

    let (engine, _engine_task) = SyncEngine::spawn(config.engine_config());
    seed(&engine, bulk).await?;

    let (conn, _conn_task) = ConnectionManager::spawn(
        WebSocketTransport::new(),
        engine.sender(),
        config.manager_config(),
    );
    let endpoint = config.stream_endpoint();
    let state = conn
        .connect(&endpoint, token)
        .await
        .with_context(|| format!("Failed to start stream at {endpoint}"))?;
    info!(endpoint = %endpoint, status = %state, "Stream started");

    let mut alerts = engine.subscribe_alerts();
    let mut snapshots = engine.watch();
    let mut conn_state = conn.watch_state();
    let mut was_connected = state == ConnectionState::Connected;
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            Ok(_) = unauthorized.wait_for(|rejected| *rejected) => {
                warn!("Session rejected; stopping");
                break;
            }
            event = alerts.recv() => match event {
                Ok(event) => {
                    metrics::record_alert(&event);
                    log_alert(&event, &engine, &labels);
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Alert subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
            Ok(()) = snapshots.changed() => {
                let snapshot = snapshots.borrow_and_update().clone();
                metrics::record_snapshot(&snapshot, config.liveness_timeout());
            }
            Ok(()) = conn_state.changed() => {
                let state = *conn_state.borrow_and_update();
                info!(status = %state, "Stream state changed");
                metrics::record_connection_state(state);

                if state == ConnectionState::Connected {
                    if was_connected {
                        spawn_resync(api.clone(), engine.clone());
                    }
                    was_connected = true;
                }
            }
            _ = stats_tick.tick() => {
                metrics::record_manager_stats(&conn.stats().snapshot());
                metrics::record_relay_liveness(
                    &engine.snapshot().fleet,
                    Utc::now(),
                    config.liveness_timeout(),
                );
            }
        }
    }

    if let Err(e) = conn.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    Ok(())
}

async fn seed(engine: &EngineHandle, bulk: BulkState) -> Result<()> {
    engine.seed_devices(bulk.devices).await?;
    engine.seed_relays(bulk.relays).await?;
    Ok(())
}

/// Reload bulk state after a reconnect to cover updates missed while the
/// stream was down. A rejection flips the client's unauthorized signal.
fn spawn_resync(api: ApiClient, engine: EngineHandle) {
    tokio::spawn(async move {
        match api.bulk_state().await {
            Ok(bulk) => {
                if let Err(e) = seed(&engine, bulk).await {
                    debug!("Resync dropped: {}", e);
                }
            }
            Err(e) => warn!("Resync failed: {}", e),
        }
    });
}

fn log_alert(event: &AlertEvent, engine: &EngineHandle, labels: &SiteLabels) {
    let handle = event.handle();
    let snapshot = engine.snapshot();
    let site = snapshot
        .fleet
        .device(&handle.key)
        .and_then(|device| device.site.as_deref())
        .map(|slug| labels.label(slug))
        .unwrap_or("-");

    match event {
        AlertEvent::Raised(_) => {
            warn!(device = %handle.key, site, alert = handle.id, "{}", handle.message());
        }
        AlertEvent::Retired { reason, .. } => {
            info!(device = %handle.key, site, alert = handle.id, reason = ?reason, "Offline alert retired");
        }
    }
}

/// Print device history, newest first.
///
/// Loads up to `pages` pages, stopping early when the history runs out.
///
/// # Errors
///
/// Returns an error if a page cannot be fetched or the session is rejected.
pub async fn print_history(config: Config, key: &str, pages: usize) -> Result<()> {
    let api = ApiClient::new(&config.api_base, config.token()?, config.http_timeout())
        .context("Failed to create REST client")?;
    let feed = load_history(api, key, pages, &config.history).await?;

    for entry in feed.entries() {
        let ts = entry
            .timestamp
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>8}  {}  {:<12} {}", entry.id, ts, entry.metric_type, entry.display_value());
    }
    if !feed.has_more() {
        println!("-- end of history --");
    }
    Ok(())
}

async fn load_history<S: HistorySource>(
    source: S,
    key: &str,
    pages: usize,
    history: &HistoryConfig,
) -> Result<HistoryFeed> {
    let pager = CursorPager::new(source);
    let query = HistoryQuery::new(key)
        .page_size(history.page_size)
        .window_hours(history.window_hours);
    let mut feed = HistoryFeed::new(query);

    for _ in 0..pages {
        if !feed.has_more() {
            break;
        }
        match feed.load_more(&pager).await {
            Ok(_) => {}
            Err(PagerError::Source(e)) if e.is_unauthorized() => {
                return Err(anyhow!(
                    "Session rejected by backend ({e}); refresh STADIUM_TOKEN and retry"
                ));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to load history for {key}"));
            }
        }
    }
    Ok(feed)
}
