//! # Rakewire Server
//!
//! Realtime fan-out server for the logistics dashboards.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (reads rakewire.toml if present)
//! JWT_SECRET=... rakewire
//!
//! # Run with a specific config file
//! rakewire /path/to/rakewire.toml
//!
//! # Override individual settings
//! RAKEWIRE_PORT=8080 RAKEWIRE__LIMITS__MAX_CONNECTIONS=5000 rakewire
//! ```

use anyhow::Result;
use rakewire_server::{metrics, run_server, Config};
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rakewire=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_layered(Some(Path::new(&path)))?,
        None => Config::load()?,
    };

    tracing::info!(host = %config.host, port = config.port, "Starting Rakewire server");

    metrics::init_metrics();

    run_server(config).await?;

    Ok(())
}
