//! In-process backend doubles for tests.
//!
//! The mock provider behaves like a statically linked plugin registry:
//! backends are keyed by name, instances count their `load_model` calls,
//! and jobs complete immediately with an echo of the prompt. Failure
//! modes (load failure, active jobs) are switchable so lifecycle tests
//! can drive the coordinator and autoscaler deterministically.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::engine::{BackendConfig, BackendInfo, BackendProvider, InferenceEngine};
use crate::types::{
    ChatCompletionRequest, CompletionRequest, CompletionResult, JobId, LoadingParameters,
};
use crate::{EngineError, Result};

/// Counters shared between a [`MockBackendProvider`] and every engine
/// instance it creates.
#[derive(Default, Debug)]
pub struct MockStats {
    pub instances_created: AtomicUsize,
    pub load_model_calls: AtomicUsize,
    pub embedding_load_calls: AtomicUsize,
    pub unload_model_calls: AtomicUsize,
    /// `n_gpu_layers` observed by the most recent load call.
    pub last_gpu_layers: AtomicI64,
}

/// A backend provider backed by in-memory engines.
pub struct MockBackendProvider {
    stats: Arc<MockStats>,
    fail_loads: AtomicBool,
    hold_jobs: Arc<AtomicBool>,
    load_delay: Mutex<Duration>,
    state: Mutex<MockProviderState>,
}

#[derive(Default)]
struct MockProviderState {
    available: BTreeMap<String, BackendConfig>,
    loaded: BTreeMap<String, ()>,
}

impl MockBackendProvider {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
            fail_loads: AtomicBool::new(false),
            hold_jobs: Arc::new(AtomicBool::new(false)),
            load_delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(MockProviderState::default()),
        }
    }

    /// Provider pre-configured with the usual backend names, all loadable.
    pub fn with_default_backends() -> Self {
        let provider = Self::new();
        let mut state = provider.state.lock();
        for name in ["llama-cpu", "llama-vulkan", "llama-metal"] {
            state.available.insert(
                name.to_string(),
                BackendConfig {
                    name: name.to_string(),
                    library_path: format!("mock://{name}"),
                    description: format!("mock {name} backend"),
                    load_on_startup: false,
                },
            );
        }
        drop(state);
        provider
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    /// Make subsequent `load_model` calls fail.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every created engine report active jobs.
    pub fn set_hold_jobs(&self, hold: bool) {
        self.hold_jobs.store(hold, Ordering::SeqCst);
    }

    /// Artificial latency inside `load_model`, for concurrency tests.
    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock() = delay;
    }
}

impl Default for MockBackendProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendProvider for MockBackendProvider {
    fn configure(&self, backends: &[BackendConfig]) -> Result<()> {
        let mut state = self.state.lock();
        for config in backends {
            state.available.insert(config.name.clone(), config.clone());
        }
        Ok(())
    }

    fn add_backend(&self, backend: BackendConfig) -> Result<()> {
        let mut state = self.state.lock();
        if state.available.contains_key(&backend.name) {
            return Err(EngineError::InvalidConfig(format!(
                "backend '{}' is already configured",
                backend.name
            )));
        }
        state.available.insert(backend.name.clone(), backend);
        Ok(())
    }

    fn load(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.available.contains_key(name) {
            return Err(EngineError::BackendUnavailable(name.to_string()));
        }
        state.loaded.insert(name.to_string(), ());
        Ok(())
    }

    fn unload(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .loaded
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::BackendNotLoaded(name.to_string()))
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.state.lock().loaded.contains_key(name)
    }

    fn available(&self) -> Vec<BackendInfo> {
        let state = self.state.lock();
        state
            .available
            .values()
            .map(|config| BackendInfo {
                name: config.name.clone(),
                description: config.description.clone(),
                library_path: config.library_path.clone(),
                is_loaded: state.loaded.contains_key(&config.name),
            })
            .collect()
    }

    fn create_instance(&self, name: &str) -> Result<Arc<dyn InferenceEngine>> {
        if !self.is_loaded(name) {
            return Err(EngineError::BackendNotLoaded(name.to_string()));
        }
        self.stats.instances_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockEngine {
            stats: Arc::clone(&self.stats),
            fail_loads: self.fail_loads.load(Ordering::SeqCst),
            hold_jobs: Arc::clone(&self.hold_jobs),
            load_delay: *self.load_delay.lock(),
            jobs: Mutex::new(BTreeMap::new()),
            next_job: AtomicU64::new(1),
            loaded: AtomicBool::new(false),
        }))
    }
}

/// One mock engine instance.
#[derive(Debug)]
pub struct MockEngine {
    stats: Arc<MockStats>,
    fail_loads: bool,
    hold_jobs: Arc<AtomicBool>,
    load_delay: Duration,
    jobs: Mutex<BTreeMap<JobId, CompletionResult>>,
    next_job: AtomicU64,
    loaded: AtomicBool,
}

impl MockEngine {
    fn finish_job(&self, text: String) -> JobId {
        let id = self.next_job.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().insert(
            id,
            CompletionResult {
                text,
                finish_reason: "stop".to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
            },
        );
        id
    }
}

impl InferenceEngine for MockEngine {
    fn load_model(
        &self,
        model_path: &Path,
        params: &LoadingParameters,
        _main_gpu_id: i32,
    ) -> Result<()> {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.stats.load_model_calls.fetch_add(1, Ordering::SeqCst);
        self.stats
            .last_gpu_layers
            .store(i64::from(params.n_gpu_layers), Ordering::SeqCst);
        if self.fail_loads {
            return Err(EngineError::ModelLoad(format!(
                "mock load failure for {}",
                model_path.display()
            )));
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn load_embedding_model(
        &self,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
    ) -> Result<()> {
        self.stats
            .embedding_load_calls
            .fetch_add(1, Ordering::SeqCst);
        self.load_model(model_path, params, main_gpu_id)
    }

    fn unload_model(&self) -> Result<()> {
        self.stats.unload_model_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn submit_completion(&self, request: &CompletionRequest) -> Result<JobId> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(EngineError::Job("no model loaded".to_string()));
        }
        Ok(self.finish_job(format!("echo: {}", request.prompt)))
    }

    fn submit_chat_completion(&self, request: &ChatCompletionRequest) -> Result<JobId> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(EngineError::Job("no model loaded".to_string()));
        }
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(self.finish_job(format!("echo: {last}")))
    }

    fn is_job_finished(&self, job: JobId) -> Result<bool> {
        Ok(self.jobs.lock().contains_key(&job))
    }

    fn wait_for_job(&self, job: JobId, _timeout: Duration) -> Result<bool> {
        self.is_job_finished(job)
    }

    fn get_job_result(&self, job: JobId) -> Result<CompletionResult> {
        self.jobs
            .lock()
            .get(&job)
            .cloned()
            .ok_or_else(|| EngineError::Job(format!("unknown job {job}")))
    }

    fn get_job_error(&self, _job: JobId) -> Option<String> {
        None
    }

    fn has_active_jobs(&self) -> bool {
        self.hold_jobs.load(Ordering::SeqCst)
    }
}
