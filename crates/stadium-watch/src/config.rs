//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (STADIUM_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use stadium_core::EngineConfig;
use stadium_transport::ManagerConfig;
use std::path::Path;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// REST base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Stream base URL.
    #[serde(default = "default_ws_base")]
    pub ws_base: String,

    /// Bearer token for REST and the stream.
    #[serde(default = "default_token", skip_serializing)]
    pub token: Option<String>,

    /// Stream configuration.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Offline alert configuration.
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Relay liveness configuration.
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// History paging configuration.
    #[serde(default)]
    pub history: HistoryConfig,

    /// HTTP client configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Path of the stream endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Fixed reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Bound on a single open attempt in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Capacity of the channel into the sync engine.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Offline alert configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Auto-expiry in milliseconds.
    #[serde(default = "default_auto_expire")]
    pub auto_expire_ms: u64,
}

/// Relay liveness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Heartbeat staleness window in milliseconds.
    #[serde(default = "default_liveness_timeout")]
    pub timeout_ms: u64,
}

/// History paging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Entries per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Look-back window in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

/// HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in milliseconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_api_base() -> String {
    std::env::var("STADIUM_API_BASE").unwrap_or_else(|_| "http://localhost:8000".to_string())
}

fn default_ws_base() -> String {
    std::env::var("STADIUM_WS_BASE").unwrap_or_else(|_| "ws://localhost:8000".to_string())
}

fn default_token() -> Option<String> {
    std::env::var("STADIUM_TOKEN").ok().filter(|t| !t.is_empty())
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_reconnect_delay() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_auto_expire() -> u64 {
    300_000 // 5 minutes
}

fn default_liveness_timeout() -> u64 {
    90_000
}

fn default_page_size() -> u32 {
    stadium_core::DEFAULT_PAGE_SIZE
}

fn default_window_hours() -> u32 {
    stadium_core::DEFAULT_WINDOW_HOURS
}

fn default_http_timeout() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            ws_base: default_ws_base(),
            token: default_token(),
            stream: StreamConfig::default(),
            alerts: AlertsConfig::default(),
            liveness: LivenessConfig::default(),
            history: HistoryConfig::default(),
            http: HttpConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            reconnect_delay_ms: default_reconnect_delay(),
            connect_timeout_ms: default_connect_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            auto_expire_ms: default_auto_expire(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_liveness_timeout(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            window_hours: default_window_hours(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_http_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "stadium.toml",
            "/etc/stadium/stadium.toml",
            "~/.config/stadium/stadium.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if no token is configured.
    pub fn token(&self) -> Result<&str> {
        match self.token.as_deref() {
            Some(token) if !token.is_empty() => Ok(token),
            _ => bail!("No token configured; set STADIUM_TOKEN or `token` in stadium.toml"),
        }
    }

    /// Full stream endpoint, without the token.
    #[must_use]
    pub fn stream_endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.ws_base.trim_end_matches('/'),
            self.stream.path.trim_start_matches('/')
        )
    }

    /// Sync engine settings.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            channel_capacity: self.stream.channel_capacity,
            alert_auto_expire: Duration::from_millis(self.alerts.auto_expire_ms),
            ..EngineConfig::default()
        }
    }

    /// Connection manager settings.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            reconnect_delay: Duration::from_millis(self.stream.reconnect_delay_ms),
            connect_timeout: Duration::from_millis(self.stream.connect_timeout_ms),
            ..ManagerConfig::default()
        }
    }

    /// Relay liveness window.
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness.timeout_ms)
    }

    /// HTTP request timeout.
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http.timeout_ms)
    }
}
