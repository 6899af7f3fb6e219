//! Server binary: configuration, state wiring and the axum listener.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kolosal_hardware::SystemGpuProbe;
use kolosal_inference::{BackendProvider, InferenceLoader};
use kolosal_server::config::{CliArgs, ServerConfig};
use kolosal_server::routes;
use kolosal_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting kolosal-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load_or_default(&args.config)?;
    config.apply_cli_overrides(&args);

    std::fs::create_dir_all(&config.server.models_dir).with_context(|| {
        format!(
            "failed to create models directory {}",
            config.server.models_dir.display()
        )
    })?;

    let provider: Arc<dyn BackendProvider> = Arc::new(InferenceLoader::new());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::build(config, args.config.clone(), provider, &SystemGpuProbe).await?;

    let app = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on http://{addr}");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown_state.shutdown().await;
        })
        .await?;

    Ok(())
}
