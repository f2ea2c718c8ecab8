//! # Stadium Watch
//!
//! Live fleet monitor for stadium field devices and relays.
//!
//! ## Usage
//!
//! ```bash
//! # Watch the live stream
//! STADIUM_TOKEN=... stadium-watch
//!
//! # Print the newest three pages of a device's history
//! stadium-watch history fov-012 3
//!
//! # Point at another backend
//! STADIUM_API_BASE=https://fov.example.com STADIUM_WS_BASE=wss://fov.example.com stadium-watch
//! ```

mod api;
mod app;
mod config;
mod metrics;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "stadium_watch=info,stadium_core=info,stadium_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [command, key, rest @ ..] = args.as_slice() {
        if command == "history" {
            let pages = match rest.first() {
                Some(pages) => pages
                    .parse()
                    .with_context(|| format!("Invalid page count: {pages}"))?,
                None => 1,
            };
            return app::print_history(config, key, pages).await;
        }
    }

    tracing::info!("Starting stadium-watch against {}", config.api_base);

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
        metrics::start_metrics_server(config.metrics.port)?;
    }

    app::run(config).await
}
