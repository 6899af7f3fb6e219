//! The download manager: one worker task per active download, shared
//! progress records, and deferred engine creation on completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::task::JoinHandle;

use kolosal_inference::LoadingParameters;

use crate::progress::{DownloadProgress, DownloadStatus, EngineCreationParams, ProgressSnapshot};
use crate::transfer::{self, TransferOutcome};
use crate::urls::{generate_download_path, is_valid_url};

/// The engine coordinator as seen from the download manager.
///
/// Completed downloads create engines through this seam instead of a
/// process-wide singleton, so ownership and shutdown order stay explicit
/// and tests can observe the calls.
#[async_trait]
pub trait EngineDirectory: Send + Sync {
    /// `(exists, is_loaded)` without triggering a load or touching
    /// activity timestamps.
    async fn engine_status(&self, engine_id: &str) -> (bool, bool);

    /// Create and immediately load an engine.
    async fn add_engine(
        &self,
        engine_id: &str,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
        backend_name: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Register an engine for lazy loading.
    async fn register_engine(
        &self,
        engine_id: &str,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
        backend_name: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Remove an engine (used to roll back a non-functional creation).
    async fn remove_engine(&self, engine_id: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct DownloadManagerConfig {
    /// Directory URL downloads land in.
    pub models_dir: PathBuf,
    pub connect_timeout: Duration,
    /// Stall window: no bytes for this long fails the transfer.
    pub read_timeout: Duration,
    /// How long terminal records stay queryable before cleanup.
    pub retention_minutes: i64,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("./models"),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            retention_minutes: 60,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    downloads: HashMap<String, Arc<DownloadProgress>>,
    workers: HashMap<String, JoinHandle<()>>,
}

/// Cloned handles a download worker runs with, detached from the
/// manager's own lock.
#[derive(Clone)]
struct WorkerDeps {
    client: Client,
    engines: Arc<dyn EngineDirectory>,
}

/// Concurrent download orchestration with progress tracking.
pub struct DownloadManager {
    client: Client,
    config: DownloadManagerConfig,
    engines: Arc<dyn EngineDirectory>,
    state: Mutex<ManagerState>,
}

impl DownloadManager {
    pub fn new(config: DownloadManagerConfig, engines: Arc<dyn EngineDirectory>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("kolosal-server/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            config,
            engines,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.config.models_dir
    }

    fn worker_deps(&self) -> WorkerDeps {
        WorkerDeps {
            client: self.client.clone(),
            engines: Arc::clone(&self.engines),
        }
    }

    /// Start a plain download. Returns `false` when a download for this
    /// id is already active.
    pub fn start(&self, model_id: &str, url: &str, local_path: PathBuf) -> bool {
        self.start_internal(model_id, url, local_path, None)
    }

    /// Start a download that creates an engine once the file is on disk.
    ///
    /// If the coordinator already has an engine with the id named by
    /// `engine_params.model_id`, no download happens: a 100%-complete
    /// record with status `engine_already_exists` is synthesized.
    pub async fn start_with_engine(
        &self,
        model_id: &str,
        url: &str,
        local_path: PathBuf,
        engine_params: EngineCreationParams,
    ) -> bool {
        let (exists, _loaded) = self.engines.engine_status(&engine_params.model_id).await;
        if exists {
            tracing::info!(
                engine_id = %engine_params.model_id,
                "Engine already exists, skipping download and engine creation"
            );
            let progress = Arc::new(DownloadProgress::with_engine_params(
                model_id,
                url,
                local_path,
                Some(engine_params),
            ));
            progress.mark_complete_bytes(0);
            progress.finish(DownloadStatus::EngineAlreadyExists, None);
            let mut state = self.state.lock();
            state.workers.remove(model_id);
            state.downloads.insert(model_id.to_string(), progress);
            return true;
        }

        self.start_internal(model_id, url, local_path, Some(engine_params))
    }

    fn start_internal(
        &self,
        model_id: &str,
        url: &str,
        local_path: PathBuf,
        engine_params: Option<EngineCreationParams>,
    ) -> bool {
        let progress = {
            let mut state = self.state.lock();

            if let Some(existing) = state.downloads.get(model_id) {
                if !existing.status().is_terminal() {
                    tracing::warn!(model_id, "Download already in progress");
                    return false;
                }
                tracing::info!(
                    model_id,
                    status = existing.status().as_str(),
                    "Purging previous download entry before restart"
                );
                state.workers.remove(model_id);
                state.downloads.remove(model_id);
            }

            let progress = Arc::new(DownloadProgress::with_engine_params(
                model_id,
                url,
                local_path,
                engine_params,
            ));
            state
                .downloads
                .insert(model_id.to_string(), Arc::clone(&progress));
            progress
        };

        let deps = self.worker_deps();
        let worker = tokio::spawn(async move {
            deps.perform_download(progress).await;
        });
        self.state
            .lock()
            .workers
            .insert(model_id.to_string(), worker);

        tracing::info!(model_id, url, "Started download");
        true
    }

    pub fn get(&self, model_id: &str) -> Option<ProgressSnapshot> {
        self.state
            .lock()
            .downloads
            .get(model_id)
            .map(|p| p.snapshot())
    }

    /// Snapshots of every tracked download, active and recent.
    pub fn list(&self) -> Vec<ProgressSnapshot> {
        let mut snapshots: Vec<ProgressSnapshot> = self
            .state
            .lock()
            .downloads
            .values()
            .map(|p| p.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        snapshots
    }

    /// Cancel one download. Only non-terminal downloads are cancellable;
    /// partial files stay on disk for a later resume.
    pub fn cancel(&self, model_id: &str) -> bool {
        let state = self.state.lock();
        let Some(progress) = state.downloads.get(model_id) else {
            tracing::warn!(model_id, "Cancel requested for unknown download");
            return false;
        };
        if !progress.status().is_cancellable() {
            return false;
        }

        progress.cancelled.store(true, Ordering::Release);
        progress.paused.store(false, Ordering::Release);
        progress.finish(DownloadStatus::Cancelled, None);
        tracing::info!(model_id, "Download cancelled");
        true
    }

    pub fn pause(&self, model_id: &str) -> bool {
        let state = self.state.lock();
        let Some(progress) = state.downloads.get(model_id) else {
            return false;
        };
        if progress.status() != DownloadStatus::Downloading {
            return false;
        }
        progress.paused.store(true, Ordering::Release);
        progress.set_status(DownloadStatus::Paused);
        tracing::info!(model_id, "Download paused");
        true
    }

    pub fn resume(&self, model_id: &str) -> bool {
        let state = self.state.lock();
        let Some(progress) = state.downloads.get(model_id) else {
            return false;
        };
        if progress.status() != DownloadStatus::Paused {
            return false;
        }
        progress.paused.store(false, Ordering::Release);
        progress.set_status(DownloadStatus::Downloading);
        tracing::info!(model_id, "Download resumed");
        true
    }

    /// Cancel every active download; returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = {
            let state = self.state.lock();
            state
                .downloads
                .iter()
                .filter(|(_, p)| p.status().is_cancellable())
                .map(|(id, _)| id.clone())
                .collect()
        };
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Wait for download workers to wind down, with staggered timeouts:
    /// the first two workers get 10 s each, the rest 3 s. Workers that
    /// exceed their window are abandoned; their partial files survive.
    pub async fn wait_for_all(&self) {
        let workers: Vec<(String, JoinHandle<()>)> = {
            let mut state = self.state.lock();
            state.workers.drain().collect()
        };

        for (completed, (model_id, handle)) in workers.into_iter().enumerate() {
            let timeout = if completed < 2 {
                Duration::from_secs(10)
            } else {
                Duration::from_secs(3)
            };
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => tracing::debug!(model_id = %model_id, "Download worker finished"),
                Err(_) => tracing::warn!(
                    model_id = %model_id,
                    timeout_secs = timeout.as_secs(),
                    "Download worker did not finish in time, abandoning"
                ),
            }
        }
    }

    /// Cancel everything and wait for workers, for process shutdown.
    pub async fn shutdown(&self) {
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled active downloads for shutdown");
            // Give transfer loops a moment to observe the flags
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.wait_for_all().await;
    }

    /// Reap terminal records older than `minutes`.
    pub fn cleanup_old(&self, minutes: i64) {
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes);
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .downloads
            .iter()
            .filter(|(_, p)| {
                p.status().is_terminal() && p.end_time().map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            tracing::info!(model_id = %id, "Cleaning up old download record");
            state.workers.remove(&id);
            state.downloads.remove(&id);
        }
    }

    /// Startup model loading. Local paths go straight to the
    /// coordinator; URLs whose file is already complete likewise; URLs
    /// needing bytes start an async download with deferred creation.
    pub async fn start_at_boot(
        &self,
        model_id: &str,
        model_path: &str,
        load_params: LoadingParameters,
        main_gpu_id: i32,
        load_immediately: bool,
        backend_name: Option<String>,
    ) -> anyhow::Result<()> {
        if !is_valid_url(model_path) {
            return self
                .create_directly(
                    model_id,
                    Path::new(model_path),
                    &load_params,
                    main_gpu_id,
                    load_immediately,
                    backend_name.as_deref(),
                )
                .await;
        }

        let local_path = generate_download_path(&self.config.models_dir, model_path);
        let local_size = std::fs::metadata(&local_path).ok().map(|m| m.len());
        if let Some(size) = local_size.filter(|s| *s > 0) {
            if let Ok(info) = transfer::get_url_file_info(&self.client, model_path).await {
                if size == info.total_bytes {
                    tracing::info!(
                        model_id,
                        path = %local_path.display(),
                        "Model file already downloaded, loading directly"
                    );
                    return self
                        .create_directly(
                            model_id,
                            &local_path,
                            &load_params,
                            main_gpu_id,
                            load_immediately,
                            backend_name.as_deref(),
                        )
                        .await;
                }
            }
        }

        let params = EngineCreationParams {
            model_id: model_id.to_string(),
            load_immediately,
            main_gpu_id,
            load_params,
            backend_name,
        };
        if self
            .start_with_engine(model_id, model_path, local_path, params)
            .await
        {
            Ok(())
        } else {
            anyhow::bail!("download already in progress for model '{model_id}'")
        }
    }

    async fn create_directly(
        &self,
        model_id: &str,
        model_path: &Path,
        load_params: &LoadingParameters,
        main_gpu_id: i32,
        load_immediately: bool,
        backend_name: Option<&str>,
    ) -> anyhow::Result<()> {
        if load_immediately {
            self.engines
                .add_engine(model_id, model_path, load_params, main_gpu_id, backend_name)
                .await
        } else {
            self.engines
                .register_engine(model_id, model_path, load_params, main_gpu_id, backend_name)
                .await
        }
    }
}

impl WorkerDeps {
    async fn perform_download(self, progress: Arc<DownloadProgress>) {
        // Pre-flight: skip the transfer when the file is already whole
        if let Some(size) = std::fs::metadata(&progress.local_path).ok().map(|m| m.len()) {
            if size > 0 {
                match transfer::get_url_file_info(&self.client, &progress.url).await {
                    Ok(info) if info.total_bytes == size => {
                        tracing::debug!(
                            model_id = %progress.model_id,
                            bytes = size,
                            "File already fully downloaded, skipping transfer"
                        );
                        progress.mark_complete_bytes(size);
                        self.finish_successful(&progress, DownloadStatus::AlreadyComplete)
                            .await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            model_id = %progress.model_id,
                            error = %e,
                            "Could not check existing file against remote"
                        );
                    }
                }
            }
        }

        match transfer::run_transfer(&self.client, &progress).await {
            Ok(TransferOutcome::Completed { total_bytes }) => {
                tracing::info!(model_id = %progress.model_id, total_bytes, "Download completed");
                progress.mark_complete_bytes(total_bytes);
                self.finish_successful(&progress, DownloadStatus::Completed)
                    .await;
            }
            Ok(TransferOutcome::AlreadyComplete { total_bytes }) => {
                progress.mark_complete_bytes(total_bytes);
                self.finish_successful(&progress, DownloadStatus::AlreadyComplete)
                    .await;
            }
            Ok(TransferOutcome::Cancelled) => {
                // cancel() already stamped the record; make sure a flag
                // set through some other path still terminates it
                if progress.end_time().is_none() {
                    progress.finish(DownloadStatus::Cancelled, None);
                }
                tracing::info!(model_id = %progress.model_id, "Download worker observed cancellation");
            }
            Err(e) => {
                if progress.status() == DownloadStatus::Cancelled {
                    return;
                }
                tracing::error!(model_id = %progress.model_id, error = %e, "Download failed");
                progress.finish(DownloadStatus::Failed, Some(e.to_string()));
            }
        }
    }

    /// Terminalize a successful transfer, chaining engine creation when
    /// requested.
    async fn finish_successful(&self, progress: &Arc<DownloadProgress>, status: DownloadStatus) {
        if progress.status() == DownloadStatus::Cancelled {
            return;
        }
        if progress.engine_params.is_some() {
            progress.set_status(status);
            self.create_engine_after_download(progress).await;
        } else {
            progress.finish(status, None);
        }
    }

    async fn create_engine_after_download(&self, progress: &Arc<DownloadProgress>) {
        let Some(params) = progress.engine_params.as_ref() else {
            return;
        };

        let (exists, _) = self.engines.engine_status(&params.model_id).await;
        if exists {
            tracing::info!(
                engine_id = %params.model_id,
                "Engine already exists, skipping creation after download"
            );
            progress.finish(DownloadStatus::EngineAlreadyExists, None);
            return;
        }

        progress.set_status(DownloadStatus::CreatingEngine);
        tracing::info!(engine_id = %params.model_id, "Starting engine creation for downloaded model");

        let result = if params.load_immediately {
            self.engines
                .add_engine(
                    &params.model_id,
                    &progress.local_path,
                    &params.load_params,
                    params.main_gpu_id,
                    params.backend_name.as_deref(),
                )
                .await
        } else {
            self.engines
                .register_engine(
                    &params.model_id,
                    &progress.local_path,
                    &params.load_params,
                    params.main_gpu_id,
                    params.backend_name.as_deref(),
                )
                .await
        };

        match result {
            Ok(()) => {
                // Confirm the engine actually landed before reporting it
                let (exists, loaded) = self.engines.engine_status(&params.model_id).await;
                let functional = exists && (!params.load_immediately || loaded);
                if functional {
                    tracing::info!(engine_id = %params.model_id, "Engine created for downloaded model");
                    progress.finish(DownloadStatus::EngineCreated, None);
                } else {
                    tracing::error!(
                        engine_id = %params.model_id,
                        "Engine reported success but is not functional, rolling back"
                    );
                    self.engines.remove_engine(&params.model_id).await;
                    progress.finish(
                        DownloadStatus::EngineCreationFailed,
                        Some("engine was created but failed verification".to_string()),
                    );
                }
            }
            Err(e) => {
                tracing::error!(engine_id = %params.model_id, error = %e, "Engine creation failed");
                progress.finish(DownloadStatus::EngineCreationFailed, Some(e.to_string()));
            }
        }
    }
}
