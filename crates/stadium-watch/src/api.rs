//! HTTP client for the dashboard backend's REST API.
//!
//! Every authenticated call sends `Authorization: Bearer <token>`. A 401 or
//! 403 from any call flips the unauthorized signal and is never retried.
//! Any other failure of the bulk load is logged and leaves that part of the
//! fleet empty; the stream fills it in.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use stadium_core::{
    DeviceRecord, HistoryError, HistoryPage, HistoryQuery, HistorySource, RelayRecord, SiteLabels,
    SiteMeta,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Error type for REST operations.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The session is no longer valid.
    #[error("Unauthorized (HTTP {status})")]
    Unauthorized {
        /// HTTP status code.
        status: u16,
    },

    /// The backend is not reachable.
    #[error("Backend not reachable at {url}: {source}")]
    NotReachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned an error response.
    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Result type for REST operations.
pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Check if this error invalidates the session.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}

/// Bulk device and relay state used to seed the sync engine.
#[derive(Debug, Default)]
pub struct BulkState {
    pub devices: HashMap<String, DeviceRecord>,
    pub relays: HashMap<String, RelayRecord>,
}

impl From<ApiError> for HistoryError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized { status } => HistoryError::Unauthorized { status },
            ApiError::Status { status, .. } => HistoryError::Status(status),
            other => HistoryError::Request(other.to_string()),
        }
    }
}

/// REST client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: String,
    unauthorized: Arc<watch::Sender<bool>>,
}

impl ApiClient {
    /// Create a client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The backend URL (e.g., "http://localhost:8000")
    /// * `token` - Bearer token
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ApiError::InvalidUrl(format!(
                "URL must start with http:// or https://, got: {}",
                base_url
            )));
        }
        let base_url = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::Request)?;

        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            unauthorized: Arc::new(watch::Sender::new(false)),
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Flips to `true` once the backend rejects the session.
    pub fn unauthorized_signal(&self) -> watch::Receiver<bool> {
        self.unauthorized.subscribe()
    }

    /// Bulk device state.
    pub async fn devices(&self) -> Result<HashMap<String, DeviceRecord>> {
        let url = self.endpoint(&["api", "devices"])?;
        self.get(url, true).await
    }

    /// Bulk relay state.
    pub async fn relays(&self) -> Result<HashMap<String, RelayRecord>> {
        let url = self.endpoint(&["api", "relays"])?;
        self.get(url, true).await
    }

    /// Public site metadata.
    pub async fn stadiums(&self) -> Result<HashMap<String, SiteMeta>> {
        let url = self.endpoint(&["api", "meta", "stadiums"])?;
        self.get(url, false).await
    }

    /// Site labels; an unreachable metadata endpoint yields slug fallbacks.
    pub async fn site_labels(&self) -> SiteLabels {
        match self.stadiums().await {
            Ok(meta) => SiteLabels::from_meta(meta),
            Err(e) => {
                debug!("Site metadata unavailable: {}", e);
                SiteLabels::new()
            }
        }
    }

    /// Load devices and relays for seeding.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthorized`] if the session is rejected. Other
    /// failures are logged and yield an empty map for that half.
    pub async fn bulk_state(&self) -> Result<BulkState> {
        let devices = degrade("devices", self.devices().await)?;
        let relays = degrade("relays", self.relays().await)?;
        info!(devices = devices.len(), relays = relays.len(), "Loaded fleet");
        Ok(BulkState { devices, relays })
    }

    /// One page of device history.
    pub async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let url = self.history_url(query)?;
        self.get(url, true).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn history_url(&self, query: &HistoryQuery) -> Result<Url> {
        let mut url = self.endpoint(&["api", "device", query.key.as_str(), "history"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("hours", &query.window_hours.to_string())
                .append_pair("page_size", &query.page_size.to_string());
            if let Some(cursor) = query.cursor {
                pairs.append_pair("last_id", &cursor.to_string());
            }
            if let Some(metric) = &query.metric_type {
                pairs.append_pair("metric_type", metric);
            }
        }
        Ok(url)
    }

    // ======================================================================
    // Internal HTTP helpers
    // ======================================================================

    async fn get<T: DeserializeOwned>(&self, url: Url, authenticated: bool) -> Result<T> {
        let mut request = self.client.get(url.clone());
        if authenticated {
            request = request.bearer_auth(&self.token);
        }

        let response = request.send().await.map_err(|e| ApiError::NotReachable {
            url: url.to_string(),
            source: e,
        })?;

        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(ApiError::Request);
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "Session rejected by backend");
            self.unauthorized.send_replace(true);
            return Err(ApiError::Unauthorized {
                status: status.as_u16(),
            });
        }

        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
            .unwrap_or_else(|| status.to_string());

        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

fn degrade<T: Default>(what: &str, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_unauthorized() => Err(e),
        Err(e) => {
            warn!("Initial {} fetch failed: {}", what, e);
            Ok(T::default())
        }
    }
}

#[async_trait]
impl HistorySource for ApiClient {
    async fn fetch_history(
        &self,
        query: &HistoryQuery,
    ) -> std::result::Result<HistoryPage, HistoryError> {
        Ok(self.history(query).await?)
    }
}

/// Canned HTTP responder for client tests.
#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve `responses` on consecutive connections and return the
    /// request heads.
    pub(crate) async fn serve(responses: &[(&str, &str)]) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let responses: Vec<String> = responses
            .iter()
            .map(|(status, body)| {
                format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                )
            })
            .collect();

        let task = tokio::spawn(async move {
            let mut heads = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
                heads.push(String::from_utf8_lossy(&head).to_string());
            }
            heads
        });
        (base, task)
    }
}
