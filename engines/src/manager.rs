//! The engine lifecycle coordinator.
//!
//! Owns the registry and the backend provider, resolves remote model
//! URLs, serializes concurrent load attempts per record, and feeds the
//! idle autoscaler. Callers get `Arc` engine handles that stay usable
//! for as long as they hold them, even across unload or removal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kolosal_downloads::{
    generate_download_path, is_valid_url, transfer, DownloadProgress, EngineDirectory,
    TransferOutcome,
};
use kolosal_hardware::GpuProbe;
use kolosal_inference::{BackendInfo, BackendProvider, InferenceEngine, LoadingParameters};

use crate::autoscaler;
use crate::record::{EngineRecord, EngineState};
use crate::registry::EngineRegistry;
use crate::{NodeError, Result};

/// Backends that run layers on a GPU and therefore get the
/// all-layers override when the caller leaves `n_gpu_layers` unset.
pub const GPU_BACKENDS: &[&str] = &["llama-vulkan", "llama-cuda", "llama-metal"];

/// Sentinel meaning "offload every layer".
pub const GPU_LAYERS_ALL: i32 = 100;

#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    /// Idle interval after which a loaded engine becomes eligible for
    /// unloading.
    pub idle_timeout: Duration,
    /// Backend used when callers do not name one. `None` falls back to
    /// platform rules.
    pub default_backend: Option<String>,
    /// Where URL models are materialized.
    pub models_dir: PathBuf,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            default_backend: None,
            models_dir: PathBuf::from("./models"),
        }
    }
}

/// Model entry handed to the persistence hook after a successful
/// add/register/remove.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedModel {
    pub id: String,
    pub path: String,
    pub load_params: LoadingParameters,
    pub main_gpu_id: i32,
    pub backend_name: String,
    pub load_immediately: bool,
}

/// Best-effort configuration persistence.
///
/// Implementations decide whether writes are permitted (opt-in env var,
/// writability probe); the coordinator behaves identically either way
/// and never blocks on the hook.
pub trait ModelPersistence: Send + Sync {
    fn persist_model(&self, model: &PersistedModel);
    fn remove_model(&self, engine_id: &str);
}

/// Listing view of one engine record.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub id: String,
    pub state: EngineState,
    pub backend_name: String,
    pub model_path: String,
    pub is_embedding: bool,
}

/// Everything needed to perform one backend load, captured while the
/// record lock is held.
struct LoadJob {
    model_path: PathBuf,
    backend_name: String,
    load_params: LoadingParameters,
    main_gpu_id: i32,
    is_embedding: bool,
}

enum GetAction {
    Return(Arc<dyn InferenceEngine>),
    Wait,
    Load(LoadJob),
}

pub struct NodeManager {
    registry: EngineRegistry,
    provider: Arc<dyn BackendProvider>,
    config: NodeManagerConfig,
    has_dedicated_gpu: bool,
    client: Client,
    persistence: Option<Arc<dyn ModelPersistence>>,
    autoscaler_notify: Notify,
    shutdown: CancellationToken,
    autoscaler_task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    pub fn new(
        provider: Arc<dyn BackendProvider>,
        config: NodeManagerConfig,
        probe: &dyn GpuProbe,
    ) -> Self {
        let client = Client::builder()
            .user_agent(concat!("kolosal-server/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            registry: EngineRegistry::new(),
            provider,
            config,
            has_dedicated_gpu: probe.has_dedicated_gpu(),
            client,
            persistence: None,
            autoscaler_notify: Notify::new(),
            shutdown: CancellationToken::new(),
            autoscaler_task: Mutex::new(None),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn ModelPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Spawn the idle autoscaler for this manager.
    pub fn start_autoscaler(self: Arc<Self>) {
        let handle = tokio::spawn(autoscaler::run(Arc::clone(&self)));
        *self.autoscaler_task.lock() = Some(handle);
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    pub fn backend_provider(&self) -> &Arc<dyn BackendProvider> {
        &self.provider
    }

    // ========== Add / register ==========

    /// Create an engine and load its model immediately.
    pub async fn add(
        &self,
        engine_id: &str,
        model_path: &str,
        load_params: LoadingParameters,
        main_gpu_id: i32,
        backend_name: Option<&str>,
    ) -> Result<()> {
        self.add_internal(engine_id, model_path, load_params, main_gpu_id, backend_name, false)
            .await
    }

    /// Create an embedding engine and load its model immediately.
    pub async fn add_embedding(
        &self,
        engine_id: &str,
        model_path: &str,
        load_params: LoadingParameters,
        main_gpu_id: i32,
    ) -> Result<()> {
        self.add_internal(engine_id, model_path, load_params, main_gpu_id, None, true)
            .await
    }

    /// Register an engine for lazy loading on first access.
    pub async fn register(
        &self,
        engine_id: &str,
        model_path: &str,
        load_params: LoadingParameters,
        main_gpu_id: i32,
        backend_name: Option<&str>,
    ) -> Result<()> {
        self.register_internal(engine_id, model_path, load_params, main_gpu_id, backend_name, false)
            .await
    }

    /// Register an embedding engine for lazy loading.
    pub async fn register_embedding(
        &self,
        engine_id: &str,
        model_path: &str,
        load_params: LoadingParameters,
        main_gpu_id: i32,
    ) -> Result<()> {
        self.register_internal(engine_id, model_path, load_params, main_gpu_id, None, true)
            .await
    }

    async fn add_internal(
        &self,
        engine_id: &str,
        model_path: &str,
        load_params: LoadingParameters,
        main_gpu_id: i32,
        backend_name: Option<&str>,
        is_embedding: bool,
    ) -> Result<()> {
        if self.registry.contains(engine_id) {
            tracing::warn!(engine_id, "Engine already exists");
            return Err(NodeError::AlreadyExists(engine_id.to_string()));
        }

        let actual_path = self.resolve_model_path(engine_id, model_path).await?;
        let backend = self.resolve_backend(backend_name)?;
        let effective_params = effective_load_params(engine_id, &backend, &load_params);

        let job = LoadJob {
            model_path: actual_path.clone(),
            backend_name: backend.clone(),
            load_params: effective_params.clone(),
            main_gpu_id,
            is_embedding,
        };
        let engine = self.instantiate_and_load(engine_id, &job).await?;

        let record = Arc::new(EngineRecord::new(
            engine_id,
            actual_path.clone(),
            backend.clone(),
            effective_params.clone(),
            main_gpu_id,
            is_embedding,
            EngineState::Loaded,
            Some(Arc::clone(&engine)),
        ));

        if self.registry.insert_if_absent(record).is_err() {
            // Another task won the double-checked insert; back out ours
            tracing::warn!(engine_id, "Engine appeared during load, discarding duplicate");
            defensive_unload(engine_id, engine).await;
            return Err(NodeError::AlreadyExists(engine_id.to_string()));
        }

        tracing::info!(
            engine_id,
            backend = %backend,
            model = %actual_path.display(),
            "Engine loaded"
        );

        self.persist(PersistedModel {
            id: engine_id.to_string(),
            path: actual_path.to_string_lossy().to_string(),
            load_params: effective_params,
            main_gpu_id,
            backend_name: backend,
            load_immediately: true,
        });
        self.autoscaler_notify.notify_one();
        Ok(())
    }

    async fn register_internal(
        &self,
        engine_id: &str,
        model_path: &str,
        load_params: LoadingParameters,
        main_gpu_id: i32,
        backend_name: Option<&str>,
        is_embedding: bool,
    ) -> Result<()> {
        if self.registry.contains(engine_id) {
            tracing::warn!(engine_id, "Engine already exists");
            return Err(NodeError::AlreadyExists(engine_id.to_string()));
        }

        let actual_path = self.resolve_model_path(engine_id, model_path).await?;
        let backend = self.resolve_backend(backend_name)?;

        // Registration stores the caller's parameters unchanged; any GPU
        // layer override happens at load time.
        let record = Arc::new(EngineRecord::new(
            engine_id,
            actual_path.clone(),
            backend.clone(),
            load_params.clone(),
            main_gpu_id,
            is_embedding,
            EngineState::Registered,
            None,
        ));

        if self.registry.insert_if_absent(record).is_err() {
            return Err(NodeError::AlreadyExists(engine_id.to_string()));
        }

        tracing::info!(
            engine_id,
            backend = %backend,
            model = %actual_path.display(),
            "Engine registered for lazy loading"
        );

        self.persist(PersistedModel {
            id: engine_id.to_string(),
            path: actual_path.to_string_lossy().to_string(),
            load_params,
            main_gpu_id,
            backend_name: backend,
            load_immediately: false,
        });
        self.autoscaler_notify.notify_one();
        Ok(())
    }

    // ========== Get ==========

    /// Return a usable engine handle, loading on demand.
    ///
    /// Concurrent calls against an unloaded record are serialized: one
    /// task performs the load while the rest wait on the record's
    /// notifier and share the outcome.
    pub async fn get(&self, engine_id: &str) -> Result<Arc<dyn InferenceEngine>> {
        let record = self
            .registry
            .get(engine_id)
            .ok_or_else(|| NodeError::NotFound(engine_id.to_string()))?;

        let action = {
            let mut state = record.lock();
            match state.status {
                EngineState::MarkedForRemoval => {
                    return Err(NodeError::NotFound(engine_id.to_string()));
                }
                EngineState::Loaded => {
                    state.touch();
                    match state.engine.clone() {
                        Some(engine) => GetAction::Return(engine),
                        None => {
                            // Should not happen; self-heal by reloading
                            state.status = EngineState::Loading;
                            GetAction::Load(Self::job_from_state(engine_id, &state))
                        }
                    }
                }
                EngineState::Loading => {
                    state.touch();
                    GetAction::Wait
                }
                EngineState::Registered | EngineState::Unloaded => {
                    state.touch();
                    state.status = EngineState::Loading;
                    tracing::info!(engine_id, "Engine not loaded, loading on demand");
                    GetAction::Load(Self::job_from_state(engine_id, &state))
                }
            }
        };

        match action {
            GetAction::Return(engine) => {
                self.autoscaler_notify.notify_one();
                Ok(engine)
            }
            GetAction::Wait => self.wait_for_load(&record).await,
            GetAction::Load(job) => self.finish_load(&record, job).await,
        }
    }

    fn job_from_state(engine_id: &str, state: &crate::record::RecordState) -> LoadJob {
        LoadJob {
            model_path: state.model_path.clone(),
            backend_name: state.backend_name.clone(),
            load_params: effective_load_params(engine_id, &state.backend_name, &state.load_params),
            main_gpu_id: state.main_gpu_id,
            is_embedding: state.is_embedding,
        }
    }

    /// Wait until a load in another task reaches a decisive state.
    async fn wait_for_load(&self, record: &Arc<EngineRecord>) -> Result<Arc<dyn InferenceEngine>> {
        loop {
            let notified = record.loading_done().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = record.lock();
                match state.status {
                    EngineState::Loaded => {
                        state.touch();
                        if let Some(engine) = state.engine.clone() {
                            drop(state);
                            self.autoscaler_notify.notify_one();
                            return Ok(engine);
                        }
                        return Err(NodeError::LoadFailed {
                            engine_id: record.id.clone(),
                            reason: "engine handle missing after load".to_string(),
                        });
                    }
                    EngineState::Unloaded => {
                        return Err(NodeError::LoadFailed {
                            engine_id: record.id.clone(),
                            reason: "load failed in another task".to_string(),
                        });
                    }
                    EngineState::MarkedForRemoval => {
                        return Err(NodeError::NotFound(record.id.clone()));
                    }
                    EngineState::Loading | EngineState::Registered => {}
                }
            }

            notified.as_mut().await;
        }
    }

    /// Perform the load claimed in `get` and publish the outcome.
    async fn finish_load(
        &self,
        record: &Arc<EngineRecord>,
        job: LoadJob,
    ) -> Result<Arc<dyn InferenceEngine>> {
        let load_result = self.instantiate_and_load(&record.id, &job).await;

        match load_result {
            Ok(engine) => {
                let removed_during_load = {
                    let mut state = record.lock();
                    if state.status == EngineState::MarkedForRemoval {
                        true
                    } else {
                        state.engine = Some(Arc::clone(&engine));
                        state.status = EngineState::Loaded;
                        state.touch();
                        false
                    }
                };
                record.notify_waiters();

                if removed_during_load {
                    tracing::info!(engine_id = %record.id, "Engine was removed during load, discarding");
                    defensive_unload(&record.id, engine).await;
                    return Err(NodeError::NotFound(record.id.clone()));
                }

                self.autoscaler_notify.notify_one();
                tracing::info!(engine_id = %record.id, "Engine loaded on demand");
                Ok(engine)
            }
            Err(e) => {
                let removed_during_load = {
                    let mut state = record.lock();
                    if state.status == EngineState::MarkedForRemoval {
                        true
                    } else {
                        state.engine = None;
                        state.status = EngineState::Unloaded;
                        false
                    }
                };
                record.notify_waiters();

                if removed_during_load {
                    return Err(NodeError::NotFound(record.id.clone()));
                }
                tracing::error!(engine_id = %record.id, error = %e, "On-demand load failed");
                Err(e)
            }
        }
    }

    /// Ensure the backend is loaded, create an instance and load the
    /// model on a blocking thread. A failed load defensively unloads the
    /// half-constructed instance before returning.
    async fn instantiate_and_load(
        &self,
        engine_id: &str,
        job: &LoadJob,
    ) -> Result<Arc<dyn InferenceEngine>> {
        if !self.provider.is_loaded(&job.backend_name) {
            tracing::info!(backend = %job.backend_name, "Loading inference backend");
            self.provider.load(&job.backend_name)?;
        }

        let engine = self.provider.create_instance(&job.backend_name)?;

        let load_engine = Arc::clone(&engine);
        let path = job.model_path.clone();
        let params = job.load_params.clone();
        let gpu = job.main_gpu_id;
        let is_embedding = job.is_embedding;
        tracing::info!(
            engine_id,
            model = %path.display(),
            n_gpu_layers = params.n_gpu_layers,
            "Loading model"
        );
        let load_result = tokio::task::spawn_blocking(move || {
            if is_embedding {
                load_engine.load_embedding_model(&path, &params, gpu)
            } else {
                load_engine.load_model(&path, &params, gpu)
            }
        })
        .await;

        let outcome = match load_result {
            Ok(outcome) => outcome,
            Err(join_err) => Err(kolosal_inference::EngineError::BackendPanic(format!(
                "load task aborted: {join_err}"
            ))),
        };

        match outcome {
            Ok(()) => Ok(engine),
            Err(e) => {
                defensive_unload(engine_id, engine).await;
                Err(NodeError::LoadFailed {
                    engine_id: engine_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // ========== Status / removal / listing ==========

    /// `(exists, is_loaded)` without triggering a load or updating the
    /// idle clock.
    pub fn get_status(&self, engine_id: &str) -> (bool, bool) {
        match self.registry.get(engine_id) {
            Some(record) => {
                let state = record.lock();
                if state.status == EngineState::MarkedForRemoval {
                    (false, false)
                } else {
                    (true, state.status == EngineState::Loaded)
                }
            }
            None => (false, false),
        }
    }

    /// Remove an engine: mark it, erase it from the registry, unload its
    /// model if loaded and wake anyone waiting on it.
    pub async fn remove(&self, engine_id: &str) -> Result<()> {
        let Some(record) = self.registry.remove(engine_id) else {
            tracing::warn!(engine_id, "Attempted to remove non-existent engine");
            return Err(NodeError::NotFound(engine_id.to_string()));
        };

        let engine = {
            let mut state = record.lock();
            state.status = EngineState::MarkedForRemoval;
            state.engine.take()
        };

        if let Some(engine) = engine {
            tracing::info!(engine_id, "Unloading engine for removal");
            defensive_unload(engine_id, engine).await;
        }

        record.notify_waiters();

        if let Some(persistence) = &self.persistence {
            persistence.remove_model(engine_id);
        }
        self.autoscaler_notify.notify_one();

        tracing::info!(engine_id, "Engine removed");
        Ok(())
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|r| !r.is_marked_for_removal())
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn engine_summaries(&self) -> Vec<EngineSummary> {
        let mut summaries: Vec<EngineSummary> = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|record| {
                let state = record.lock();
                if state.status == EngineState::MarkedForRemoval {
                    return None;
                }
                Some(EngineSummary {
                    id: record.id.clone(),
                    state: state.status,
                    backend_name: state.backend_name.clone(),
                    model_path: state.model_path.to_string_lossy().to_string(),
                    is_embedding: state.is_embedding,
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn list_available_backends(&self) -> Vec<BackendInfo> {
        self.provider.available()
    }

    /// Stop the autoscaler and unload every engine.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.autoscaler_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        for record in self.registry.snapshot() {
            let engine = {
                let mut state = record.lock();
                state.status = EngineState::Unloaded;
                state.engine.take()
            };
            if let Some(engine) = engine {
                defensive_unload(&record.id, engine).await;
            }
            record.notify_waiters();
        }
    }

    // ========== Internals ==========

    fn persist(&self, model: PersistedModel) {
        if let Some(persistence) = &self.persistence {
            persistence.persist_model(&model);
        }
    }

    /// Resolve a model path or URL to a local `.gguf` file.
    async fn resolve_model_path(&self, engine_id: &str, model_path: &str) -> Result<PathBuf> {
        if is_valid_url(model_path) {
            return self.resolve_url_download(engine_id, model_path).await;
        }

        let path = Path::new(model_path);
        let metadata = std::fs::metadata(path).map_err(|_| {
            NodeError::Validation(format!("model file does not exist: {model_path}"))
        })?;

        if metadata.is_file() {
            tracing::info!(
                engine_id,
                size_mb = metadata.len() as f64 / (1024.0 * 1024.0),
                "Local model file found"
            );
            return Ok(path.to_path_buf());
        }

        if metadata.is_dir() {
            return find_gguf_in_dir(path).ok_or_else(|| {
                NodeError::Validation(format!(
                    "directory contains no .gguf file: {model_path}"
                ))
            });
        }

        Err(NodeError::Validation(format!(
            "model path is not a regular file: {model_path}"
        )))
    }

    /// Synchronous URL resolution for direct add/register calls: reuse a
    /// complete local file, resume a partial one, or download fresh.
    async fn resolve_url_download(&self, engine_id: &str, url: &str) -> Result<PathBuf> {
        let local_path = generate_download_path(&self.config.models_dir, url);
        let info = transfer::get_url_file_info(&self.client, url).await?;

        let local_size = std::fs::metadata(&local_path).ok().map(|m| m.len());
        if local_size == Some(info.total_bytes) {
            tracing::info!(
                engine_id,
                path = %local_path.display(),
                "Model already downloaded"
            );
            return Ok(local_path);
        }

        tracing::info!(engine_id, url, "Downloading model before engine creation");
        let progress = DownloadProgress::new(engine_id, url, local_path.clone());
        match transfer::run_transfer(&self.client, &progress).await? {
            TransferOutcome::Completed { .. } | TransferOutcome::AlreadyComplete { .. } => {
                Ok(local_path)
            }
            TransferOutcome::Cancelled => Err(NodeError::Validation(format!(
                "download interrupted for {url}"
            ))),
        }
    }

    /// Pick the backend for a request: explicit name, configured
    /// default, then platform fallback.
    fn resolve_backend(&self, requested: Option<&str>) -> Result<String> {
        let available = self.provider.available();

        if let Some(name) = requested.filter(|n| !n.is_empty()) {
            if available.iter().any(|b| b.name == name) {
                return Ok(name.to_string());
            }
            return Err(NodeError::BackendSelection(format!(
                "backend '{name}' is not configured"
            )));
        }

        if let Some(name) = &self.config.default_backend {
            if available.iter().any(|b| &b.name == name) {
                return Ok(name.clone());
            }
            tracing::warn!(
                backend = %name,
                "Configured default backend is not available, applying platform rules"
            );
        }

        select_default_backend(&available, cfg!(target_os = "macos"), self.has_dedicated_gpu)
            .ok_or_else(|| {
                NodeError::BackendSelection("no inference backends configured".to_string())
            })
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) async fn autoscaler_notified(&self) {
        self.autoscaler_notify.notified().await;
    }

    /// One autoscaler pass: unload idle engines without active jobs and
    /// compute how long to sleep before the next pass.
    pub fn autoscale_pass(&self) -> Duration {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut next_wake: Option<Instant> = None;

        for record in self.registry.snapshot() {
            let mut state = record.lock();
            if state.status != EngineState::Loaded {
                continue;
            }
            let Some(engine) = state.engine.clone() else {
                continue;
            };

            let idle = now.saturating_duration_since(state.last_activity);
            if idle >= idle_timeout {
                if engine.has_active_jobs() {
                    tracing::debug!(
                        engine_id = %record.id,
                        idle_secs = idle.as_secs(),
                        "Idle engine has active jobs, skipping unload"
                    );
                    continue;
                }
                tracing::info!(
                    engine_id = %record.id,
                    idle_secs = idle.as_secs(),
                    threshold_secs = idle_timeout.as_secs(),
                    "Unloading idle engine"
                );
                if let Err(e) = engine.unload_model() {
                    tracing::error!(engine_id = %record.id, error = %e, "Unload failed");
                }
                state.engine = None;
                state.status = EngineState::Unloaded;
            } else {
                let wake = state.last_activity + idle_timeout;
                next_wake = Some(next_wake.map_or(wake, |w| w.min(wake)));
            }
        }

        let until_wake = next_wake
            .map(|w| w.saturating_duration_since(now))
            .unwrap_or(Duration::from_secs(60));
        until_wake
            .min(idle_timeout / 2)
            .min(Duration::from_secs(60))
            .max(Duration::from_secs(1))
    }
}

/// Unload an instance we are about to discard, trapping every failure.
async fn defensive_unload(engine_id: &str, engine: Arc<dyn InferenceEngine>) {
    let id = engine_id.to_string();
    let result = tokio::task::spawn_blocking(move || engine.unload_model()).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(engine_id = %id, error = %e, "Cleanup unload reported failure")
        }
        Err(e) => tracing::warn!(engine_id = %id, error = %e, "Cleanup unload task aborted"),
    }
}

/// First `.gguf` file found inside a directory model path.
fn find_gguf_in_dir(dir: &Path) -> Option<PathBuf> {
    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        let is_gguf = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("gguf"))
            .unwrap_or(false);
        if path.is_file() && is_gguf {
            return Some(path);
        }
    }
    None
}

/// Apply the GPU all-layers override exactly for GPU-class backends.
fn effective_load_params(
    engine_id: &str,
    backend_name: &str,
    params: &LoadingParameters,
) -> LoadingParameters {
    let mut effective = params.clone();
    if GPU_BACKENDS.contains(&backend_name) && effective.n_gpu_layers <= 0 {
        effective.n_gpu_layers = GPU_LAYERS_ALL;
        tracing::info!(
            engine_id,
            backend = backend_name,
            "Forcing n_gpu_layers={} for GPU backend",
            GPU_LAYERS_ALL
        );
    }
    effective
}

/// Platform fallback rules: Apple prefers Metal, hosts with a dedicated
/// GPU prefer Vulkan, everything else lands on CPU (or whatever exists).
fn select_default_backend(
    available: &[BackendInfo],
    is_apple: bool,
    has_dedicated_gpu: bool,
) -> Option<String> {
    if available.is_empty() {
        return None;
    }
    let pick = |name: &str| {
        available
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.name.clone())
    };
    let first = || Some(available[0].name.clone());

    if is_apple {
        pick("llama-metal").or_else(|| pick("llama-cpu")).or_else(first)
    } else if has_dedicated_gpu {
        pick("llama-vulkan").or_else(first)
    } else {
        pick("llama-cpu").or_else(first)
    }
}

#[async_trait]
impl EngineDirectory for NodeManager {
    async fn engine_status(&self, engine_id: &str) -> (bool, bool) {
        self.get_status(engine_id)
    }

    async fn add_engine(
        &self,
        engine_id: &str,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
        backend_name: Option<&str>,
    ) -> anyhow::Result<()> {
        self.add(
            engine_id,
            &model_path.to_string_lossy(),
            params.clone(),
            main_gpu_id,
            backend_name,
        )
        .await
        .map_err(anyhow::Error::from)
    }

    async fn register_engine(
        &self,
        engine_id: &str,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
        backend_name: Option<&str>,
    ) -> anyhow::Result<()> {
        self.register(
            engine_id,
            &model_path.to_string_lossy(),
            params.clone(),
            main_gpu_id,
            backend_name,
        )
        .await
        .map_err(anyhow::Error::from)
    }

    async fn remove_engine(&self, engine_id: &str) -> bool {
        self.remove(engine_id).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(names: &[&str]) -> Vec<BackendInfo> {
        names
            .iter()
            .map(|name| BackendInfo {
                name: (*name).to_string(),
                description: String::new(),
                library_path: format!("/lib/lib{name}.so"),
                is_loaded: false,
            })
            .collect()
    }

    #[test]
    fn apple_prefers_metal_then_cpu_then_first() {
        let all = backends(&["llama-cpu", "llama-metal", "llama-vulkan"]);
        assert_eq!(
            select_default_backend(&all, true, false).as_deref(),
            Some("llama-metal")
        );
        let no_metal = backends(&["llama-vulkan", "llama-cpu"]);
        assert_eq!(
            select_default_backend(&no_metal, true, true).as_deref(),
            Some("llama-cpu")
        );
        let odd = backends(&["custom"]);
        assert_eq!(select_default_backend(&odd, true, false).as_deref(), Some("custom"));
    }

    #[test]
    fn dedicated_gpu_prefers_vulkan_else_first() {
        let all = backends(&["llama-cpu", "llama-vulkan"]);
        assert_eq!(
            select_default_backend(&all, false, true).as_deref(),
            Some("llama-vulkan")
        );
        let no_vulkan = backends(&["llama-cpu", "llama-cuda"]);
        assert_eq!(
            select_default_backend(&no_vulkan, false, true).as_deref(),
            Some("llama-cpu")
        );
    }

    #[test]
    fn cpu_host_prefers_cpu_backend() {
        let all = backends(&["llama-vulkan", "llama-cpu"]);
        assert_eq!(
            select_default_backend(&all, false, false).as_deref(),
            Some("llama-cpu")
        );
        assert_eq!(select_default_backend(&[], false, false), None);
    }

    #[test]
    fn gpu_layer_override_applies_only_to_gpu_backends() {
        let params = LoadingParameters {
            n_gpu_layers: 0,
            ..Default::default()
        };
        for backend in GPU_BACKENDS {
            assert_eq!(
                effective_load_params("e", backend, &params).n_gpu_layers,
                GPU_LAYERS_ALL
            );
        }
        assert_eq!(effective_load_params("e", "llama-cpu", &params).n_gpu_layers, 0);

        let negative = LoadingParameters {
            n_gpu_layers: -1,
            ..Default::default()
        };
        assert_eq!(
            effective_load_params("e", "llama-vulkan", &negative).n_gpu_layers,
            GPU_LAYERS_ALL
        );

        let explicit = LoadingParameters {
            n_gpu_layers: 12,
            ..Default::default()
        };
        assert_eq!(
            effective_load_params("e", "llama-vulkan", &explicit).n_gpu_layers,
            12
        );
    }
}
