//! # Junction
//!
//! WAMP router serving one realm over WebSocket and raw socket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! junction
//!
//! # Run with custom config
//! junction --config /path/to/junction.toml
//!
//! # Raw socket on a unix socket only, with the demo echo procedure
//! junction --ws=false --rs-proto unix --rs-host /tmp/junction.sock --decho
//!
//! # Run with environment variables
//! JUNCTION_REALM=realm1 JUNCTION_WS_PORT=8080 junction
//! ```

mod app;
mod bootstrap;
mod config;
mod context;
mod demo;
mod error;
mod metrics;
mod shutdown;
mod transports;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "junction=info,tenvis_junction=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = config::Cli::parse();
    let settings = match config::Config::load(&cli).and_then(config::Config::resolve) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(phase = e.phase(), error = %e, "Startup failed");
            return Err(e.into());
        }
    };

    tracing::info!(realm = %settings.router.realm, "Starting Junction");

    if let Some(port) = settings.metrics_port {
        metrics::init_metrics();
        metrics::start_metrics_server(port)
            .with_context(|| format!("failed to start metrics exporter on port {}", port))?;
    }

    let report = app::run(settings, shutdown::interrupts()).await?;
    for (resource, error) in &report.failures {
        tracing::warn!(resource = %resource, error = %error, "Resource was not released cleanly");
    }

    Ok(())
}
