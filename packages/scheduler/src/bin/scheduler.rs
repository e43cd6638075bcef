// Main entry point for the scheduler service

use anyhow::{Context, Result};
use scheduler_core::app::SchedulerApp;
use scheduler_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scheduler_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Airbyte scheduler");

    let config = Config::from_env().context("Failed to load configuration")?;
    SchedulerApp::new(config).run().await
}
