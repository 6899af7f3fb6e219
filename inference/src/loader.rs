//! Dynamic loader for inference backend plugins.
//!
//! Keeps two tables: every configured backend (`available`) and the
//! subset whose library is currently mapped (`loaded`). Loading resolves
//! the two fixed factory symbols; a missing symbol is a hard failure and
//! the backend never becomes available for instantiation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use crate::engine::{BackendConfig, BackendInfo, BackendProvider, InferenceEngine};
use crate::ffi::{
    CreateEngineFn, DestroyEngineFn, PluginEngine, CREATE_ENGINE_SYMBOL, DESTROY_ENGINE_SYMBOL,
};
use crate::{EngineError, Result};

struct AvailableBackend {
    config: BackendConfig,
}

struct LoadedBackend {
    library: Arc<Library>,
    create: CreateEngineFn,
    destroy: DestroyEngineFn,
}

#[derive(Default)]
struct LoaderState {
    available: BTreeMap<String, AvailableBackend>,
    loaded: BTreeMap<String, LoadedBackend>,
}

/// Loader and registry for dynamically linked inference backends.
pub struct InferenceLoader {
    state: Mutex<LoaderState>,
}

impl InferenceLoader {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoaderState::default()),
        }
    }

    fn open_library(config: &BackendConfig) -> Result<LoadedBackend> {
        // SAFETY: loading a shared library runs its initializers. The
        // path was validated to exist during configuration, and the
        // resulting handle is only used through the typed factory
        // symbols resolved below.
        let library = unsafe { Library::new(&config.library_path) }.map_err(|e| {
            EngineError::LibraryLoad(format!("{}: {}", config.library_path, e))
        })?;
        let library = Arc::new(library);

        // SAFETY: symbol types are fixed by the plugin ABI contract.
        let create: CreateEngineFn = unsafe {
            *library.get(CREATE_ENGINE_SYMBOL).map_err(|_| {
                EngineError::SymbolNotFound(format!(
                    "create_inference_engine in {}",
                    config.library_path
                ))
            })?
        };
        let destroy: DestroyEngineFn = unsafe {
            *library.get(DESTROY_ENGINE_SYMBOL).map_err(|_| {
                EngineError::SymbolNotFound(format!(
                    "destroy_inference_engine in {}",
                    config.library_path
                ))
            })?
        };

        Ok(LoadedBackend {
            library,
            create,
            destroy,
        })
    }

    fn load_locked(state: &mut LoaderState, name: &str) -> Result<()> {
        if state.loaded.contains_key(name) {
            return Ok(());
        }
        let entry = state
            .available
            .get(name)
            .ok_or_else(|| EngineError::BackendUnavailable(name.to_string()))?;

        let loaded = Self::open_library(&entry.config)?;
        tracing::info!(backend = name, library = %entry.config.library_path, "Loaded inference backend");
        state.loaded.insert(name.to_string(), loaded);
        Ok(())
    }
}

impl Default for InferenceLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendProvider for InferenceLoader {
    fn configure(&self, backends: &[BackendConfig]) -> Result<()> {
        let mut accepted = 0usize;
        let mut state = self.state.lock();

        for config in backends {
            if config.name.is_empty() {
                tracing::warn!(library = %config.library_path, "Skipping backend entry with empty name");
                continue;
            }
            if !Path::new(&config.library_path).exists() {
                tracing::warn!(
                    backend = %config.name,
                    library = %config.library_path,
                    "Skipping backend entry: library not found on disk"
                );
                continue;
            }

            state.available.insert(
                config.name.clone(),
                AvailableBackend {
                    config: config.clone(),
                },
            );
            accepted += 1;

            if config.load_on_startup {
                if let Err(e) = Self::load_locked(&mut state, &config.name) {
                    tracing::warn!(backend = %config.name, error = %e, "Startup load failed");
                }
            }
        }

        if accepted == 0 && !backends.is_empty() {
            return Err(EngineError::InvalidConfig(
                "no inference backend entry could be configured".to_string(),
            ));
        }
        Ok(())
    }

    fn add_backend(&self, backend: BackendConfig) -> Result<()> {
        if backend.name.is_empty() {
            return Err(EngineError::InvalidConfig(
                "backend name must not be empty".to_string(),
            ));
        }
        if !Path::new(&backend.library_path).exists() {
            return Err(EngineError::LibraryLoad(format!(
                "library not found: {}",
                backend.library_path
            )));
        }

        let mut state = self.state.lock();
        if state.available.contains_key(&backend.name) {
            return Err(EngineError::InvalidConfig(format!(
                "backend '{}' is already configured",
                backend.name
            )));
        }
        let load_now = backend.load_on_startup;
        let name = backend.name.clone();
        state
            .available
            .insert(name.clone(), AvailableBackend { config: backend });
        if load_now {
            Self::load_locked(&mut state, &name)?;
        }
        Ok(())
    }

    fn load(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::load_locked(&mut state, name)
    }

    fn unload(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.loaded.remove(name) {
            Some(loaded) => {
                drop(loaded.library);
                tracing::info!(backend = name, "Unloaded inference backend");
                Ok(())
            }
            None => Err(EngineError::BackendNotLoaded(name.to_string())),
        }
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.state.lock().loaded.contains_key(name)
    }

    fn available(&self) -> Vec<BackendInfo> {
        let state = self.state.lock();
        state
            .available
            .values()
            .map(|entry| BackendInfo {
                name: entry.config.name.clone(),
                description: entry.config.description.clone(),
                library_path: entry.config.library_path.clone(),
                is_loaded: state.loaded.contains_key(&entry.config.name),
            })
            .collect()
    }

    fn create_instance(&self, name: &str) -> Result<Arc<dyn InferenceEngine>> {
        let (create, destroy, library) = {
            let state = self.state.lock();
            let loaded = state
                .loaded
                .get(name)
                .ok_or_else(|| EngineError::BackendNotLoaded(name.to_string()))?;
            (loaded.create, loaded.destroy, Arc::clone(&loaded.library))
        };

        // SAFETY: create/destroy came from this library's factory symbols
        // and the Arc keeps the library mapped for the engine's lifetime.
        let raw = std::panic::catch_unwind(|| unsafe { create() }).map_err(|_| {
            EngineError::BackendPanic(format!("create_inference_engine panicked in '{name}'"))
        })?;
        let engine = unsafe { PluginEngine::from_raw(raw, destroy, library)? };
        Ok(Arc::new(engine))
    }
}

impl Drop for InferenceLoader {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for (name, loaded) in std::mem::take(&mut state.loaded) {
            // Library unmap can run foreign finalizers; trap and log.
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| drop(loaded.library)));
            if result.is_err() {
                tracing::error!(backend = %name, "Backend library panicked during release");
            }
        }
    }
}
