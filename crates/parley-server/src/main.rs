//! # Parley Server
//!
//! Long-polling chat server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with a config file in the working directory
//! cp parley.example.toml parley.toml && parley
//!
//! # Run with environment variables
//! PARLEY_PORT=8888 PARLEY_HOST=0.0.0.0 parley
//!
//! # Keep sessions valid across restarts
//! PARLEY_COOKIE_SECRET=$(openssl rand -hex 32) parley
//! ```

mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
