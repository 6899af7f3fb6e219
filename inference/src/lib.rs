/*!
Inference backend abstraction and dynamic plugin loading.

A backend is a native library that knows how to load GGUF models and run
completion jobs. Backends are discovered by logical name ("llama-cpu",
"llama-vulkan", "llama-metal", ...) and bound at runtime through two
exported C symbols; see [`ffi`] for the binding contract. Orchestration
code only ever sees the safe [`InferenceEngine`] trait and the
[`BackendProvider`] seam, so tests can substitute [`mock`] doubles.
*/

use thiserror::Error;

pub mod engine;
pub mod ffi;
pub mod loader;
pub mod mock;
pub mod types;

pub use engine::{BackendConfig, BackendInfo, BackendProvider, InferenceEngine};
pub use loader::InferenceLoader;
pub use types::{
    ChatCompletionRequest, ChatMessage, CompletionRequest, CompletionResult, JobId,
    LoadingParameters,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to load library: {0}")]
    LibraryLoad(String),

    #[error("Required symbol missing from backend library: {0}")]
    SymbolNotFound(String),

    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    #[error("Backend not loaded: {0}")]
    BackendNotLoaded(String),

    #[error("Backend panicked across the plugin boundary: {0}")]
    BackendPanic(String),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
