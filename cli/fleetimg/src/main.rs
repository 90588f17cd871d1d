//! fleetimg - CLI for the fleetimage device image pipeline.
//!
//! Downloads device images through the caching pipeline, stages them at
//! temporary locations and manages the local cache.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    Cli::parse().run().await
}
