//! opsd-daemon entry point.
//!
//! Reads configuration from the environment, starts the daemon and runs
//! until SIGINT or SIGTERM, then drains the ingest pipelines.

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opsd_daemon::config::Config;
use opsd_daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("load configuration")?;
    let daemon = Daemon::start(config).await?;

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    daemon.shutdown().await;
    Ok(())
}
