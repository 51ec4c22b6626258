//! SAGE server binary.
//!
//! Loads configuration from the environment, wires the application state,
//! seeds an empty collection when a bootstrap file is configured, and
//! serves the HTTP API.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use sage::db::seed;
use sage::{api, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("failed to load configuration")?;

    std::fs::create_dir_all(&config.index.data_dir)
        .context("failed to create data directory")?;

    let state = AppState::from_config(&config)
        .await
        .context("failed to build application state")?;

    if let Some(seed_file) = &config.index.seed_file {
        match seed::bootstrap_from_file(
            state.pipeline.index_ref(),
            &config.index.collection,
            seed_file,
        )
        .await
        {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "seeded vector collection"),
            Err(err) => tracing::warn!(error = %err, "seed bootstrap failed"),
        }
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "SAGE server listening");

    axum::serve(listener, api::routes(state))
        .await
        .context("server error")?;

    Ok(())
}
