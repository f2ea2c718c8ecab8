//! Cursor-based history pagination.
//!
//! History is served newest first. A page is requested with an exclusive
//! cursor (the smallest id seen so far) and the backend answers with
//! entries strictly older than it.
//!
//! ```text
//!   HistoryFeed ──load_more──▶ CursorPager ──fetch_history──▶ HistorySource
//!       ▲                           │                              (REST)
//!       └──── appended entries ◀────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::timestamp;

/// Default entries per page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Default look-back window in hours.
pub const DEFAULT_WINDOW_HOURS: u32 = 24;

/// History source errors.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The session is no longer valid (401/403).
    #[error("Unauthorized (HTTP {status})")]
    Unauthorized {
        /// HTTP status code.
        status: u16,
    },

    /// The request could not be completed.
    #[error("Request failed: {0}")]
    Request(String),

    /// The backend answered with an error status.
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
}

impl HistoryError {
    /// Check if this error invalidates the session.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, HistoryError::Unauthorized { .. })
    }
}

/// Pager errors.
#[derive(Debug, Error)]
pub enum PagerError {
    /// A fetch for this entity is already outstanding.
    #[error("History fetch already in flight for {0}")]
    InFlight(String),

    /// The source failed.
    #[error(transparent)]
    Source(#[from] HistoryError),
}

/// One history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Monotonically increasing row id.
    pub id: i64,

    /// When the metric was recorded.
    #[serde(
        rename = "ts",
        default,
        deserialize_with = "timestamp::deserialize_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,

    /// Metric name, e.g. `battery` or `temperature`.
    #[serde(rename = "metric", default)]
    pub metric_type: String,

    /// Raw value; usually a JSON-encoded string.
    #[serde(default)]
    pub value: Value,
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl HistoryEntry {
    /// Human-readable value.
    ///
    /// Battery readings render as `<pct>%`, temperature readings as
    /// `<deg>°C`. Anything else, or anything that does not parse, renders
    /// the raw value.
    #[must_use]
    pub fn display_value(&self) -> String {
        let parsed = match &self.value {
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(parsed) => parsed,
                Err(_) => return raw.clone(),
            },
            other => other.clone(),
        };

        match self.metric_type.as_str() {
            "battery" => {
                let pct = parsed
                    .get("Battery_Percentage")
                    .or_else(|| parsed.get("Battery Percentage"))
                    .unwrap_or(&parsed);
                format!("{}%", render(pct))
            }
            "temperature" => match parsed.get("Temperature") {
                Some(deg) => format!("{}°C", render(deg)),
                None => render(&self.value),
            },
            _ => render(&self.value),
        }
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Entries ordered by id descending.
    #[serde(rename = "logs", default)]
    pub entries: Vec<HistoryEntry>,

    /// Whether a strictly older page exists.
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,

    /// Id of the last entry, as echoed by the backend.
    #[serde(rename = "lastId", default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<i64>,
}

/// Parameters of one history request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Device key.
    pub key: String,
    /// Exclusive upper bound on ids.
    pub cursor: Option<i64>,
    /// Maximum entries to return.
    pub page_size: u32,
    /// Look-back window in hours.
    pub window_hours: u32,
    /// Optional metric filter.
    pub metric_type: Option<String>,
}

impl HistoryQuery {
    /// A first-page query with default page size and window.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cursor: None,
            page_size: DEFAULT_PAGE_SIZE,
            window_hours: DEFAULT_WINDOW_HOURS,
            metric_type: None,
        }
    }

    /// Set the exclusive cursor.
    #[must_use]
    pub fn before(mut self, cursor: Option<i64>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Set the page size.
    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the look-back window.
    #[must_use]
    pub fn window_hours(mut self, window_hours: u32) -> Self {
        self.window_hours = window_hours;
        self
    }

    /// Filter on one metric.
    #[must_use]
    pub fn metric(mut self, metric_type: impl Into<String>) -> Self {
        self.metric_type = Some(metric_type.into());
        self
    }
}

/// Where history pages come from.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch one page.
    async fn fetch_history(&self, query: &HistoryQuery) -> Result<HistoryPage, HistoryError>;
}

/// Clears an entity's in-flight flag on drop, including on cancellation.
struct InFlightGuard<'a> {
    in_flight: &'a DashSet<String>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Single-page fetcher with one outstanding request per entity.
pub struct CursorPager<S> {
    source: S,
    in_flight: DashSet<String>,
}

impl<S: HistorySource> CursorPager<S> {
    /// Create a pager over `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            in_flight: DashSet::new(),
        }
    }

    /// Fetch one page for `key`, older than `cursor`.
    ///
    /// # Errors
    ///
    /// Fails fast with [`PagerError::InFlight`] if a fetch for `key` is
    /// outstanding, or with [`PagerError::Source`] if the source fails.
    pub async fn fetch_page(
        &self,
        key: &str,
        cursor: Option<i64>,
        page_size: u32,
        window_hours: u32,
    ) -> Result<HistoryPage, PagerError> {
        let query = HistoryQuery::new(key)
            .before(cursor)
            .page_size(page_size)
            .window_hours(window_hours);
        self.fetch(&query).await
    }

    /// Fetch one page for an arbitrary query.
    ///
    /// # Errors
    ///
    /// Same as [`CursorPager::fetch_page`].
    pub async fn fetch(&self, query: &HistoryQuery) -> Result<HistoryPage, PagerError> {
        if !self.in_flight.insert(query.key.clone()) {
            debug!(device = %query.key, "History fetch already in flight");
            return Err(PagerError::InFlight(query.key.clone()));
        }
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            key: query.key.clone(),
        };

        let page = self.source.fetch_history(query).await?;
        trace!(
            device = %query.key,
            cursor = ?query.cursor,
            entries = page.entries.len(),
            has_more = page.has_more,
            "History page fetched"
        );
        Ok(page)
    }

    /// Check if a fetch for `key` is outstanding.
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    /// The underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }
}

/// Accumulated history for one device.
#[derive(Debug, Clone)]
pub struct HistoryFeed {
    query: HistoryQuery,
    entries: Vec<HistoryEntry>,
    has_more: bool,
}

impl HistoryFeed {
    /// Start an empty feed.
    #[must_use]
    pub fn new(query: HistoryQuery) -> Self {
        Self {
            query,
            entries: Vec::new(),
            has_more: true,
        }
    }

    /// Entries accumulated so far, newest first.
    #[must_use]
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Whether older entries may exist.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Id of the oldest accumulated entry.
    #[must_use]
    pub fn cursor(&self) -> Option<i64> {
        self.entries.last().map(|entry| entry.id)
    }

    /// Fetch the next page and append it.
    ///
    /// Returns the number of appended entries. Entries not strictly older
    /// than the cursor are dropped, and a page that appends nothing ends
    /// the feed.
    ///
    /// # Errors
    ///
    /// Returns the pager's error; the feed is left unchanged.
    pub async fn load_more<S: HistorySource>(
        &mut self,
        pager: &CursorPager<S>,
    ) -> Result<usize, PagerError> {
        if !self.has_more {
            return Ok(0);
        }

        let query = self.query.clone().before(self.cursor());
        let page = pager.fetch(&query).await?;

        let mut cursor = self.cursor();
        let before = self.entries.len();
        for entry in page.entries {
            if cursor.is_some_and(|c| entry.id >= c) {
                trace!(device = %self.query.key, id = entry.id, "Dropping out-of-order history entry");
                continue;
            }
            cursor = Some(entry.id);
            self.entries.push(entry);
        }

        let appended = self.entries.len() - before;
        self.has_more = page.has_more && appended > 0;
        Ok(appended)
    }
}
