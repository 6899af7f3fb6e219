//! The per-engine record: configuration, lifecycle state and the live
//! backend instance.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::Notify;

use kolosal_inference::{InferenceEngine, LoadingParameters};

/// Lifecycle state of one engine record.
///
/// `MarkedForRemoval` is terminal; the record is simultaneously being
/// erased from the registry map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Registered,
    Loading,
    Loaded,
    Unloaded,
    MarkedForRemoval,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Unloaded => "unloaded",
            Self::MarkedForRemoval => "marked_for_removal",
        }
    }
}

/// Mutable state guarded by the record's own mutex.
#[derive(Debug)]
pub struct RecordState {
    pub model_path: PathBuf,
    pub backend_name: String,
    pub load_params: LoadingParameters,
    pub main_gpu_id: i32,
    pub is_embedding: bool,
    pub status: EngineState,
    pub last_activity: Instant,
    /// Present exactly when `status == Loaded`.
    pub engine: Option<Arc<dyn InferenceEngine>>,
}

/// One named engine.
///
/// Records are shared by `Arc`: a handle obtained from the registry stays
/// valid even after the record is erased from the map. The mutex guards
/// state transitions; `loading_done` wakes waiters when a load attempt
/// finishes (in success or failure) or the record is removed.
#[derive(Debug)]
pub struct EngineRecord {
    pub id: String,
    state: Mutex<RecordState>,
    loading_done: Notify,
}

impl EngineRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        model_path: PathBuf,
        backend_name: String,
        load_params: LoadingParameters,
        main_gpu_id: i32,
        is_embedding: bool,
        status: EngineState,
        engine: Option<Arc<dyn InferenceEngine>>,
    ) -> Self {
        debug_assert_eq!(status == EngineState::Loaded, engine.is_some());
        Self {
            id: id.to_string(),
            state: Mutex::new(RecordState {
                model_path,
                backend_name,
                load_params,
                main_gpu_id,
                is_embedding,
                status,
                last_activity: Instant::now(),
                engine,
            }),
            loading_done: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock()
    }

    pub fn status(&self) -> EngineState {
        self.state.lock().status
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().status == EngineState::Loaded
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.state.lock().status == EngineState::MarkedForRemoval
    }

    /// Future that resolves after the next `notify_waiters` call.
    ///
    /// Callers must create (and poll-register via `enable`) the returned
    /// future *before* re-checking state, so a transition between the
    /// check and the await cannot be missed.
    pub fn loading_done(&self) -> &Notify {
        &self.loading_done
    }

    pub fn notify_waiters(&self) {
        self.loading_done.notify_waiters();
    }
}

impl RecordState {
    /// Reset the idle clock. `Instant::now()` is monotone, so
    /// `last_activity` never moves backwards.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
