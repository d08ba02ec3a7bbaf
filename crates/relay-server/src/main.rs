//! # Relay Server
//!
//! Multi-tenant realtime pub/sub broker speaking the Pusher Channels protocol.
//!
//! ## Usage
//!
//! ```bash
//! # Run with relay.toml from the working directory or a default path
//! relay
//!
//! # Run with custom config
//! relay --config /path/to/relay.toml
//!
//! # Override settings with environment variables
//! RELAY_SERVER__PORT=6001 RELAY_SERVER__HOST=0.0.0.0 relay
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tenvis_relay_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info,tenvis_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = config_path()?;
    let config = Config::load(path.as_deref()).context("Failed to load configuration")?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting Relay server"
    );

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    handlers::run_server(config).await
}

/// Parse `--config <path>` (or `--config=<path>`) from the command line.
fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut path = None;

    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--config=") {
            path = Some(PathBuf::from(value));
            continue;
        }
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().context("--config requires a path")?;
                path = Some(PathBuf::from(value));
            }
            other => bail!("Unknown argument: {other}"),
        }
    }

    Ok(path)
}
