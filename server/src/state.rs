//! Shared application state: the root orchestration value handed to
//! every request handler.
//!
//! Owns the engine coordinator and the download manager explicitly (no
//! process-wide singletons), which makes initialization order obvious
//! and shutdown deterministic: downloads first, then engines.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use kolosal_downloads::{DownloadManager, DownloadManagerConfig};
use kolosal_engines::{NodeManager, NodeManagerConfig};
use kolosal_hardware::GpuProbe;
use kolosal_inference::BackendProvider;

use crate::config::{ConfigPersistence, ServerConfig};

#[derive(Clone)]
pub struct AppState {
    pub engines: Arc<NodeManager>,
    pub downloads: Arc<DownloadManager>,
    pub config: Arc<ServerConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire up the orchestration core from configuration.
    ///
    /// The backend provider and GPU probe are injected so tests can use
    /// in-process doubles.
    pub async fn build(
        config: ServerConfig,
        config_path: PathBuf,
        provider: Arc<dyn BackendProvider>,
        probe: &dyn GpuProbe,
    ) -> anyhow::Result<Self> {
        if !config.inference_engines.is_empty() {
            if let Err(e) = provider.configure(&config.inference_engines) {
                tracing::error!(error = %e, "Failed to configure inference backends");
            }
        }

        let persistence = Arc::new(ConfigPersistence::new(config_path, config.clone()));
        let manager_config = NodeManagerConfig {
            idle_timeout: Duration::from_secs(config.server.idle_timeout_secs),
            default_backend: config.default_inference_engine.clone(),
            models_dir: config.server.models_dir.clone(),
        };
        let engines = Arc::new(
            NodeManager::new(Arc::clone(&provider), manager_config, probe)
                .with_persistence(persistence),
        );
        Arc::clone(&engines).start_autoscaler();

        let download_config = DownloadManagerConfig {
            models_dir: config.server.models_dir.clone(),
            retention_minutes: config.server.download_retention_minutes,
            ..Default::default()
        };
        let downloads = Arc::new(DownloadManager::new(
            download_config,
            Arc::clone(&engines) as Arc<dyn kolosal_downloads::EngineDirectory>,
        ));

        // Reap terminal download records past the retention window
        let retention = config.server.download_retention_minutes;
        let cleanup_downloads = Arc::clone(&downloads);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            interval.tick().await;
            loop {
                interval.tick().await;
                cleanup_downloads.cleanup_old(retention);
            }
        });

        let state = Self {
            engines,
            downloads,
            config: Arc::new(config),
            started_at: Utc::now(),
        };
        state.load_startup_models().await;
        Ok(state)
    }

    /// Load (or start downloading) every model from the config file.
    async fn load_startup_models(&self) {
        for model in &self.config.models {
            tracing::info!(model_id = %model.id, path = %model.path, "Loading startup model");
            let result = self
                .downloads
                .start_at_boot(
                    &model.id,
                    &model.path,
                    model.load_params.clone(),
                    model.main_gpu_id,
                    model.load_immediately,
                    model.inference_engine.clone(),
                )
                .await;
            if let Err(e) = result {
                tracing::error!(model_id = %model.id, error = %e, "Startup model failed");
            }
        }
    }

    /// Deterministic shutdown: stop transfers before tearing down the
    /// engines they might still be creating.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.downloads.shutdown().await;
        self.engines.shutdown().await;
    }
}
