//! # stadium-core
//!
//! Client-side state for a fleet of stadium field devices and relays.
//!
//! This crate provides:
//!
//! - **Reconciler** - Merges device and relay patches and detects
//!   connectivity edges
//! - **Notifier** - One offline alert per device, retired by a came-online
//!   edge or by auto-expiry
//! - **Liveness** - Relay liveness from the server flag or heartbeat age
//! - **SyncEngine** - The single-writer task publishing state snapshots
//! - **Pager** - Cursor-based history pagination
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  mpsc  ┌─────────────┐ watch  ┌─────────────┐
//! │  Connection │───────▶│ SyncEngine  │───────▶│   Readers   │
//! └─────────────┘        └─────────────┘        └─────────────┘
//!                           │        │ broadcast
//!                           ▼        ▼
//!                  ┌────────────┐  ┌─────────────┐
//!                  │ Reconciler │─▶│  Notifier   │
//!                  └────────────┘  └─────────────┘
//! ```

pub mod engine;
pub mod liveness;
pub mod notifier;
pub mod pager;
pub mod reconciler;
pub mod record;
pub mod timestamp;
pub mod view;

pub use engine::{EngineConfig, EngineError, EngineHandle, Inbound, StateSnapshot, SyncEngine};
pub use liveness::{is_alive, is_alive_within, LIVENESS_TIMEOUT};
pub use notifier::{
    AlertEvent, AlertHandle, AlertId, Notifier, RetireReason, ALERT_AUTO_EXPIRE, MAX_AUTO_EXPIRE,
};
pub use pager::{
    CursorPager, HistoryEntry, HistoryError, HistoryFeed, HistoryPage, HistoryQuery,
    HistorySource, PagerError, DEFAULT_PAGE_SIZE, DEFAULT_WINDOW_HOURS,
};
pub use reconciler::{detect_edge, Edge, ReconcileError, Reconciler, ReconcilerStats};
pub use record::{DeviceRecord, RelayRecord};
pub use view::{DeviceCounts, DeviceFilter, Fleet, RelayStatus, SiteLabels, SiteMeta};
