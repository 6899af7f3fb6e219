/*!
Engine lifecycle orchestration.

The registry ([`EngineRegistry`]) is the catalog of named engine records;
the coordinator ([`NodeManager`]) drives every record through its
lifecycle (register → load → use → idle-unload → remove), serializing
concurrent load attempts per record; the autoscaler unloads engines whose
idle time exceeds the configured timeout.
*/

use thiserror::Error;

mod autoscaler;
pub mod manager;
pub mod record;
pub mod registry;

pub use manager::{
    EngineSummary, ModelPersistence, NodeManager, NodeManagerConfig, PersistedModel,
};
pub use record::{EngineRecord, EngineState};
pub use registry::EngineRegistry;

use kolosal_downloads::DownloadError;
use kolosal_inference::EngineError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Engine '{0}' already exists")]
    AlreadyExists(String),

    #[error("Engine '{0}' not found")]
    NotFound(String),

    #[error("Model validation failed: {0}")]
    Validation(String),

    #[error("No inference backend available: {0}")]
    BackendSelection(String),

    #[error("Backend error: {0}")]
    Backend(#[from] EngineError),

    #[error("Failed to load model for engine '{engine_id}': {reason}")]
    LoadFailed { engine_id: String, reason: String },

    #[error("Model download failed: {0}")]
    Download(#[from] DownloadError),
}

pub type Result<T> = std::result::Result<T, NodeError>;
