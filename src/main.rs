mod backend;
mod cache;
mod config;
mod error;
mod mqtt;
mod web;

use eyre::Result;
use tracing_subscriber::{Layer, layer::SubscriberExt};

pub fn build_logger() -> Result<()> {
    // Create an env filter that defaults to "info" level if RUST_LOG is not set,
    // while quieting the chattier dependency targets
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info")
            .add_directive("rumqttc=warn".parse().unwrap())
            .add_directive("tungstenite=warn".parse().unwrap())
            .add_directive("tokio_tungstenite=warn".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("tower_http=warn".parse().unwrap())
    });

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_filter(env_filter),
        ),
    )
    .map_err(|e| eyre::eyre!("Failed to initialize logger: {}", e))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    build_logger()?;
    tracing::info!("iohub version: {}", env!("CARGO_PKG_VERSION"));

    let config = config::AppConfig::load_or_default();
    tracing::debug!("Active configuration: {:?}", config);

    backend::setup_and_run_backend(config).await?;

    tracing::info!("Application shutdown complete");
    Ok(())
}
