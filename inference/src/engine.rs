//! The backend capability contract consumed by the orchestration layer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{
    ChatCompletionRequest, CompletionRequest, CompletionResult, JobId, LoadingParameters,
};
use crate::Result;

/// A live inference backend instance.
///
/// Methods are blocking; callers treat them as opaque bounded calls and
/// dispatch them off the async runtime where appropriate. Implementations
/// must be internally synchronized (`Send + Sync`).
pub trait InferenceEngine: Send + Sync + std::fmt::Debug {
    fn load_model(
        &self,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
    ) -> Result<()>;

    /// Embedding models use a distinct backend entry point.
    fn load_embedding_model(
        &self,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
    ) -> Result<()>;

    fn unload_model(&self) -> Result<()>;

    fn submit_completion(&self, request: &CompletionRequest) -> Result<JobId>;

    fn submit_chat_completion(&self, request: &ChatCompletionRequest) -> Result<JobId>;

    fn is_job_finished(&self, job: JobId) -> Result<bool>;

    /// Block until the job finishes or `timeout` elapses; returns whether
    /// the job finished.
    fn wait_for_job(&self, job: JobId, timeout: Duration) -> Result<bool>;

    fn get_job_result(&self, job: JobId) -> Result<CompletionResult>;

    fn get_job_error(&self, job: JobId) -> Option<String>;

    /// Whether any submitted job is still running. The autoscaler will
    /// not unload an engine that reports active jobs.
    fn has_active_jobs(&self) -> bool;
}

/// One configured backend entry, as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    pub library_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub load_on_startup: bool,
}

/// Introspection view of a configured backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub description: String,
    pub library_path: String,
    pub is_loaded: bool,
}

/// Uniform handle to the set of named backends.
///
/// Implemented by [`crate::InferenceLoader`] for dynamic libraries and by
/// [`crate::mock`] doubles for tests.
pub trait BackendProvider: Send + Sync {
    /// Validate and register entries; optionally load those marked
    /// `load_on_startup`. Individual entries fail non-fatally; the call
    /// succeeds iff at least one entry was accepted.
    fn configure(&self, backends: &[BackendConfig]) -> Result<()>;

    /// Register a single backend entry after startup.
    fn add_backend(&self, backend: BackendConfig) -> Result<()>;

    /// Load a configured backend. Loading an already-loaded backend is ok.
    fn load(&self, name: &str) -> Result<()>;

    /// Unload a backend library. Callers must ensure no outstanding
    /// instances exist.
    fn unload(&self, name: &str) -> Result<()>;

    fn is_loaded(&self, name: &str) -> bool;

    fn available(&self) -> Vec<BackendInfo>;

    /// Create a fresh engine instance from a loaded backend.
    fn create_instance(&self, name: &str) -> Result<Arc<dyn InferenceEngine>>;
}
