//! Sync engine: the single writer.
//!
//! One task owns the [`Reconciler`] and consumes a bounded channel strictly
//! in arrival order. Work that is already queued is applied as one batch;
//! after each batch that mutated state it publishes an immutable
//! [`StateSnapshot`] on a `watch` channel, and every alert transition goes
//! out on a `broadcast` channel. Alert expiry is handled by
//! sleeping until the notifier's next deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stadium_protocol::Update;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::notifier::{AlertEvent, AlertHandle, Notifier, ALERT_AUTO_EXPIRE};
use crate::reconciler::{Reconciler, ReconcilerStats};
use crate::record::{DeviceRecord, RelayRecord};
use crate::view::Fleet;

/// Most inbound items applied before a snapshot is published.
const MAX_BATCH: usize = 256;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine task has stopped.
    #[error("Sync engine closed")]
    Closed,
}

/// Work for the engine.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A decoded stream update.
    Update(Update),
    /// Initial bulk device load.
    SeedDevices(HashMap<String, DeviceRecord>),
    /// Initial bulk relay load.
    SeedRelays(HashMap<String, RelayRecord>),
}

impl From<Update> for Inbound {
    fn from(update: Update) -> Self {
        Inbound::Update(update)
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Inbound channel capacity.
    pub channel_capacity: usize,
    /// Offline alert auto-expiry.
    pub alert_auto_expire: Duration,
    /// Alert broadcast capacity.
    pub alert_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            alert_auto_expire: ALERT_AUTO_EXPIRE,
            alert_capacity: 256,
        }
    }
}

/// Committed state, as seen by readers.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    /// Mutation counter.
    pub revision: u64,
    /// Devices and relays.
    pub fleet: Fleet,
    /// Active offline alerts, ordered by device key.
    pub alerts: Vec<AlertHandle>,
    /// Reconciler counters.
    pub stats: ReconcilerStats,
}

impl StateSnapshot {
    fn capture(reconciler: &Reconciler) -> Self {
        Self {
            revision: reconciler.revision(),
            fleet: reconciler.fleet().clone(),
            alerts: reconciler.notifier().snapshot(),
            stats: reconciler.stats(),
        }
    }
}

/// Handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    inbound: mpsc::Sender<Inbound>,
    state: watch::Receiver<Arc<StateSnapshot>>,
    alerts: broadcast::Sender<AlertEvent>,
}

impl EngineHandle {
    /// Sender for inbound work, e.g. for the connection manager.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Inbound> {
        self.inbound.clone()
    }

    /// The latest committed state.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.state.clone()
    }

    /// Subscribe to alert transitions.
    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    /// Submit a stream update.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] if the engine has stopped.
    pub async fn apply(&self, update: Update) -> Result<(), EngineError> {
        self.send(Inbound::Update(update)).await
    }

    /// Submit a bulk device load.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] if the engine has stopped.
    pub async fn seed_devices(
        &self,
        devices: HashMap<String, DeviceRecord>,
    ) -> Result<(), EngineError> {
        self.send(Inbound::SeedDevices(devices)).await
    }

    /// Submit a bulk relay load.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] if the engine has stopped.
    pub async fn seed_relays(
        &self,
        relays: HashMap<String, RelayRecord>,
    ) -> Result<(), EngineError> {
        self.send(Inbound::SeedRelays(relays)).await
    }

    async fn send(&self, inbound: Inbound) -> Result<(), EngineError> {
        self.inbound
            .send(inbound)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

/// The engine task.
pub struct SyncEngine {
    reconciler: Reconciler,
    inbound: mpsc::Receiver<Inbound>,
    state: watch::Sender<Arc<StateSnapshot>>,
    alerts: broadcast::Sender<AlertEvent>,
}

impl SyncEngine {
    /// Spawn the engine on the current runtime.
    ///
    /// The task runs until every [`EngineHandle`] and inbound sender is
    /// dropped.
    #[must_use]
    pub fn spawn(config: EngineConfig) -> (EngineHandle, JoinHandle<()>) {
        let (engine, handle) = Self::new(config);
        let task = tokio::spawn(engine.run());
        (handle, task)
    }

    fn new(config: EngineConfig) -> (Self, EngineHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(Arc::new(StateSnapshot::default()));
        let (alerts_tx, _) = broadcast::channel(config.alert_capacity.max(1));

        let engine = SyncEngine {
            reconciler: Reconciler::new(Notifier::with_auto_expire(config.alert_auto_expire)),
            inbound: inbound_rx,
            state: state_tx,
            alerts: alerts_tx.clone(),
        };
        let handle = EngineHandle {
            inbound: inbound_tx,
            state: state_rx,
            alerts: alerts_tx,
        };
        (engine, handle)
    }

    async fn run(mut self) {
        info!("Sync engine started");

        loop {
            let deadline = self.reconciler.next_alert_deadline();

            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(inbound) => {
                        self.handle_batch(inbound);
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    let expired = self.reconciler.expire_alerts(Instant::now());
                    self.commit(expired);
                }
            }
        }

        info!("Sync engine stopped");
    }

    /// Apply `first` and whatever is already queued, then commit once.
    fn handle_batch(&mut self, first: Inbound) -> usize {
        let mut events = Vec::new();
        let mut handled = 0;
        let mut next = Some(first);

        while let Some(inbound) = next {
            events.extend(self.handle(inbound));
            handled += 1;
            next = if handled < MAX_BATCH {
                self.inbound.try_recv().ok()
            } else {
                None
            };
        }

        if handled > 1 {
            debug!(handled, "Applied inbound batch");
        }
        self.commit(events);
        handled
    }

    fn handle(&mut self, inbound: Inbound) -> Vec<AlertEvent> {
        let now = Instant::now();
        match inbound {
            Inbound::Update(update) => self
                .reconciler
                .apply_update(update, now)
                .ok()
                .flatten()
                .into_iter()
                .collect(),
            Inbound::SeedDevices(devices) => {
                self.reconciler.seed_devices(devices);
                Vec::new()
            }
            Inbound::SeedRelays(relays) => {
                self.reconciler.seed_relays(relays);
                Vec::new()
            }
        }
    }

    /// Publish state if it changed, then broadcast alert events.
    fn commit(&mut self, events: Vec<AlertEvent>) {
        if self.state.borrow().revision != self.reconciler.revision() {
            self.state
                .send_replace(Arc::new(StateSnapshot::capture(&self.reconciler)));
        }

        for event in events {
            if self.alerts.send(event).is_err() {
                debug!("No alert subscribers");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::RetireReason;
    use serde_json::{json, Map, Value};

    fn message(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    #[tokio::test]
    async fn test_update_publishes_snapshot() {
        let (engine, _task) = SyncEngine::spawn(EngineConfig::default());
        let mut state = engine.watch();

        engine
            .apply(Update::device("A", message(json!({"name": "Gate A"}))))
            .await
            .unwrap();
        state.changed().await.unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(
            snapshot.fleet.device("A").unwrap().name.as_deref(),
            Some("Gate A")
        );
    }

    #[tokio::test]
    async fn test_arrival_order() {
        let (engine, _task) = SyncEngine::spawn(EngineConfig::default());
        let mut state = engine.watch();

        for charge in [10.0, 20.0, 30.0] {
            engine
                .apply(Update::device("A", message(json!({"batteryCharge": charge}))))
                .await
                .unwrap();
        }
        state
            .wait_for(|snapshot| snapshot.revision == 3)
            .await
            .unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(
            snapshot.fleet.device("A").unwrap().battery_charge_percent,
            Some(30.0)
        );
    }

    #[tokio::test]
    async fn test_seed_then_stream() {
        let (engine, _task) = SyncEngine::spawn(EngineConfig::default());
        let mut alerts = engine.subscribe_alerts();
        let mut state = engine.watch();

        let mut devices = HashMap::new();
        devices.insert(
            "A".to_string(),
            serde_json::from_value(json!({"name": "Gate A", "wifiConnected": true})).unwrap(),
        );
        engine.seed_devices(devices).await.unwrap();
        engine
            .seed_relays(HashMap::from([("r1".to_string(), RelayRecord::default())]))
            .await
            .unwrap();
        engine
            .apply(Update::device("A", message(json!({"wifiConnected": false}))))
            .await
            .unwrap();

        match alerts.recv().await.unwrap() {
            AlertEvent::Raised(handle) => assert_eq!(handle.display_name, "Gate A"),
            other => panic!("Expected raise, got {:?}", other),
        }
        state.wait_for(|s| s.revision == 3).await.unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.alerts.len(), 1);
        assert_eq!(snapshot.fleet.relay_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_auto_expires() {
        let (engine, _task) = SyncEngine::spawn(EngineConfig::default());
        let mut alerts = engine.subscribe_alerts();
        let start = Instant::now();

        engine
            .apply(Update::device("A", message(json!({"wifiConnected": true}))))
            .await
            .unwrap();
        engine
            .apply(Update::device("A", message(json!({"wifiConnected": false}))))
            .await
            .unwrap();

        assert!(matches!(alerts.recv().await.unwrap(), AlertEvent::Raised(_)));

        match alerts.recv().await.unwrap() {
            AlertEvent::Retired { handle, reason } => {
                assert_eq!(handle.key, "A");
                assert_eq!(reason, RetireReason::Expired);
            }
            other => panic!("Expected expiry, got {:?}", other),
        }
        assert!(start.elapsed() >= ALERT_AUTO_EXPIRE);
        assert!(engine.snapshot().alerts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_came_online_cancels_expiry() {
        let (engine, _task) = SyncEngine::spawn(EngineConfig::default());
        let mut alerts = engine.subscribe_alerts();

        for connected in [true, false, true] {
            engine
                .apply(Update::device("A", message(json!({"wifiConnected": connected}))))
                .await
                .unwrap();
        }

        assert!(matches!(alerts.recv().await.unwrap(), AlertEvent::Raised(_)));
        assert!(matches!(
            alerts.recv().await.unwrap(),
            AlertEvent::Retired { reason: RetireReason::CameOnline, .. }
        ));

        // No expiry fires after the alert was retired.
        let quiet = tokio::time::timeout(ALERT_AUTO_EXPIRE * 2, alerts.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_queued_updates_publish_once() {
        let (mut engine, handle) = SyncEngine::new(EngineConfig::default());
        let mut state = handle.watch();
        let mut alerts = handle.subscribe_alerts();
        let sender = handle.sender();

        for connected in [true, false, true, false] {
            let update = Update::device("A", message(json!({"wifiConnected": connected})));
            sender.try_send(Inbound::from(update)).unwrap();
        }

        let first = engine.inbound.try_recv().unwrap();
        assert_eq!(engine.handle_batch(first), 4);

        assert!(state.has_changed().unwrap());
        assert_eq!(state.borrow_and_update().revision, 4);
        assert!(!state.has_changed().unwrap());

        // Alert transitions from the batch are still delivered in order.
        assert!(matches!(alerts.try_recv().unwrap(), AlertEvent::Raised(_)));
        assert!(matches!(
            alerts.try_recv().unwrap(),
            AlertEvent::Retired { reason: RetireReason::CameOnline, .. }
        ));
        assert!(matches!(alerts.try_recv().unwrap(), AlertEvent::Raised(_)));
        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batch_is_bounded() {
        let (mut engine, handle) = SyncEngine::new(EngineConfig::default());
        let sender = handle.sender();

        for i in 0..MAX_BATCH + 10 {
            let update = Update::device(format!("D{i}"), message(json!({"name": "Gate"})));
            sender.try_send(Inbound::from(update)).unwrap();
        }

        let first = engine.inbound.try_recv().unwrap();
        assert_eq!(engine.handle_batch(first), MAX_BATCH);
        assert_eq!(handle.snapshot().revision, MAX_BATCH as u64);
    }

    #[tokio::test]
    async fn test_stops_when_handles_dropped() {
        let (engine, task) = SyncEngine::spawn(EngineConfig::default());
        drop(engine);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_engine() {
        let (engine, task) = SyncEngine::spawn(EngineConfig::default());
        task.abort();
        let _ = task.await;

        let result = engine.seed_relays(HashMap::new()).await;
        assert!(matches!(result, Err(EngineError::Closed)));
    }
}
