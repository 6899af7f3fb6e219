//! C ABI contract between the server and backend plugin libraries.
//!
//! A backend library exports exactly two symbols:
//!
//! - `create_inference_engine() -> *mut RawEngine`
//! - `destroy_inference_engine(*mut RawEngine)`
//!
//! The returned [`RawEngine`] carries an opaque instance pointer and a
//! vtable of function pointers. Requests and results cross the boundary
//! as NUL-terminated UTF-8 JSON; strings returned by the plugin are freed
//! through the vtable's `free_string`. Panics and foreign exceptions must
//! not cross this boundary in either direction: every call into the
//! plugin is wrapped in `catch_unwind` on our side.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use libloading::Library;

use crate::engine::InferenceEngine;
use crate::types::{
    ChatCompletionRequest, CompletionRequest, CompletionResult, JobId, LoadingParameters,
};
use crate::{EngineError, Result};

/// Symbol names fixed by the plugin contract.
pub const CREATE_ENGINE_SYMBOL: &[u8] = b"create_inference_engine\0";
pub const DESTROY_ENGINE_SYMBOL: &[u8] = b"destroy_inference_engine\0";

/// Loading parameters as laid out across the C boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawLoadingParameters {
    pub n_ctx: u32,
    pub n_keep: u32,
    pub use_mlock: bool,
    pub use_mmap: bool,
    pub cont_batching: bool,
    pub warmup: bool,
    pub n_parallel: u32,
    pub n_gpu_layers: i32,
    pub n_batch: u32,
    pub n_ubatch: u32,
}

impl From<&LoadingParameters> for RawLoadingParameters {
    fn from(p: &LoadingParameters) -> Self {
        Self {
            n_ctx: p.n_ctx,
            n_keep: p.n_keep,
            use_mlock: p.use_mlock,
            use_mmap: p.use_mmap,
            cont_batching: p.cont_batching,
            warmup: p.warmup,
            n_parallel: p.n_parallel,
            n_gpu_layers: p.n_gpu_layers,
            n_batch: p.n_batch,
            n_ubatch: p.n_ubatch,
        }
    }
}

/// Function table exported by a backend instance.
#[repr(C)]
pub struct RawEngineVTable {
    pub load_model: unsafe extern "C" fn(
        instance: *mut c_void,
        model_path: *const c_char,
        params: *const RawLoadingParameters,
        main_gpu_id: c_int,
    ) -> bool,
    pub load_embedding_model: unsafe extern "C" fn(
        instance: *mut c_void,
        model_path: *const c_char,
        params: *const RawLoadingParameters,
        main_gpu_id: c_int,
    ) -> bool,
    pub unload_model: unsafe extern "C" fn(instance: *mut c_void) -> bool,
    /// Takes a JSON completion request; returns a job id, or a negative
    /// value on submission failure.
    pub submit_completion: unsafe extern "C" fn(instance: *mut c_void, request_json: *const c_char) -> i64,
    pub submit_chat_completion:
        unsafe extern "C" fn(instance: *mut c_void, request_json: *const c_char) -> i64,
    pub is_job_finished: unsafe extern "C" fn(instance: *mut c_void, job_id: u64) -> bool,
    pub wait_for_job:
        unsafe extern "C" fn(instance: *mut c_void, job_id: u64, timeout_ms: u64) -> bool,
    /// Returns a JSON result string owned by the plugin, or null.
    pub get_job_result: unsafe extern "C" fn(instance: *mut c_void, job_id: u64) -> *mut c_char,
    pub get_job_error: unsafe extern "C" fn(instance: *mut c_void, job_id: u64) -> *mut c_char,
    pub has_active_jobs: unsafe extern "C" fn(instance: *mut c_void) -> bool,
    pub free_string: unsafe extern "C" fn(s: *mut c_char),
}

/// Top-level object returned by `create_inference_engine`.
#[repr(C)]
pub struct RawEngine {
    pub instance: *mut c_void,
    pub vtable: *const RawEngineVTable,
}

pub type CreateEngineFn = unsafe extern "C" fn() -> *mut RawEngine;
pub type DestroyEngineFn = unsafe extern "C" fn(*mut RawEngine);

/// Safe wrapper around one plugin engine instance.
///
/// Keeps the originating [`Library`] alive for its whole lifetime and
/// traps panics at every call site.
pub struct PluginEngine {
    raw: *mut RawEngine,
    destroy: DestroyEngineFn,
    _library: Arc<Library>,
}

impl std::fmt::Debug for PluginEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEngine").field("raw", &self.raw).finish()
    }
}

// The plugin contract requires instances to be internally synchronized.
unsafe impl Send for PluginEngine {}
unsafe impl Sync for PluginEngine {}

impl PluginEngine {
    /// # Safety
    /// `raw` must be a live pointer returned by the library's create
    /// symbol, with a valid non-null vtable.
    pub(crate) unsafe fn from_raw(
        raw: *mut RawEngine,
        destroy: DestroyEngineFn,
        library: Arc<Library>,
    ) -> Result<Self> {
        if raw.is_null() || (*raw).vtable.is_null() {
            return Err(EngineError::BackendUnavailable(
                "backend returned a null engine".to_string(),
            ));
        }
        Ok(Self {
            raw,
            destroy,
            _library: library,
        })
    }

    fn vtable(&self) -> &RawEngineVTable {
        // Validated non-null in from_raw; the plugin owns the allocation
        // until destroy is called from Drop.
        unsafe { &*(*self.raw).vtable }
    }

    fn instance(&self) -> *mut c_void {
        unsafe { (*self.raw).instance }
    }

    /// Run a plugin call, converting panics into error returns so they
    /// never unwind across the ABI seam.
    fn trapped<T>(&self, what: &str, f: impl FnOnce() -> T) -> Result<T> {
        catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            EngineError::BackendPanic(format!("{what}: {msg}"))
        })
    }

    /// Copy a plugin-owned string and return it through `free_string`.
    fn take_string(&self, ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let s = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { (self.vtable().free_string)(ptr) };
        Some(s)
    }

    fn path_cstring(path: &Path) -> Result<CString> {
        CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
            EngineError::ModelLoad(format!(
                "model path contains interior NUL: {}",
                path.display()
            ))
        })
    }

    fn submit_json(&self, what: &str, json: String, submit: unsafe extern "C" fn(*mut c_void, *const c_char) -> i64) -> Result<JobId> {
        let request = CString::new(json)
            .map_err(|_| EngineError::Job("request contains interior NUL".to_string()))?;
        let job = self.trapped(what, || unsafe { submit(self.instance(), request.as_ptr()) })?;
        if job < 0 {
            return Err(EngineError::Job(format!("{what} rejected by backend")));
        }
        Ok(job as JobId)
    }
}

impl InferenceEngine for PluginEngine {
    fn load_model(
        &self,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
    ) -> Result<()> {
        let path = Self::path_cstring(model_path)?;
        let raw_params = RawLoadingParameters::from(params);
        let ok = self.trapped("load_model", || unsafe {
            (self.vtable().load_model)(self.instance(), path.as_ptr(), &raw_params, main_gpu_id)
        })?;
        if ok {
            Ok(())
        } else {
            Err(EngineError::ModelLoad(format!(
                "backend failed to load model {}",
                model_path.display()
            )))
        }
    }

    fn load_embedding_model(
        &self,
        model_path: &Path,
        params: &LoadingParameters,
        main_gpu_id: i32,
    ) -> Result<()> {
        let path = Self::path_cstring(model_path)?;
        let raw_params = RawLoadingParameters::from(params);
        let ok = self.trapped("load_embedding_model", || unsafe {
            (self.vtable().load_embedding_model)(
                self.instance(),
                path.as_ptr(),
                &raw_params,
                main_gpu_id,
            )
        })?;
        if ok {
            Ok(())
        } else {
            Err(EngineError::ModelLoad(format!(
                "backend failed to load embedding model {}",
                model_path.display()
            )))
        }
    }

    fn unload_model(&self) -> Result<()> {
        let ok = self.trapped("unload_model", || unsafe {
            (self.vtable().unload_model)(self.instance())
        })?;
        if ok {
            Ok(())
        } else {
            Err(EngineError::Job("backend failed to unload model".to_string()))
        }
    }

    fn submit_completion(&self, request: &CompletionRequest) -> Result<JobId> {
        let json = serde_json::to_string(request)?;
        self.submit_json("submit_completion", json, self.vtable().submit_completion)
    }

    fn submit_chat_completion(&self, request: &ChatCompletionRequest) -> Result<JobId> {
        let json = serde_json::to_string(request)?;
        self.submit_json(
            "submit_chat_completion",
            json,
            self.vtable().submit_chat_completion,
        )
    }

    fn is_job_finished(&self, job: JobId) -> Result<bool> {
        self.trapped("is_job_finished", || unsafe {
            (self.vtable().is_job_finished)(self.instance(), job)
        })
    }

    fn wait_for_job(&self, job: JobId, timeout: Duration) -> Result<bool> {
        let timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        self.trapped("wait_for_job", || unsafe {
            (self.vtable().wait_for_job)(self.instance(), job, timeout_ms)
        })
    }

    fn get_job_result(&self, job: JobId) -> Result<CompletionResult> {
        let raw = self.trapped("get_job_result", || unsafe {
            (self.vtable().get_job_result)(self.instance(), job)
        })?;
        let json = self
            .take_string(raw)
            .ok_or_else(|| EngineError::Job(format!("no result available for job {job}")))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn get_job_error(&self, job: JobId) -> Option<String> {
        let raw = self
            .trapped("get_job_error", || unsafe {
                (self.vtable().get_job_error)(self.instance(), job)
            })
            .ok()?;
        self.take_string(raw)
    }

    fn has_active_jobs(&self) -> bool {
        self.trapped("has_active_jobs", || unsafe {
            (self.vtable().has_active_jobs)(self.instance())
        })
        .unwrap_or(false)
    }
}

impl Drop for PluginEngine {
    fn drop(&mut self) {
        let raw = self.raw;
        let destroy = self.destroy;
        // A panicking destructor must not take the process down with it.
        let result = catch_unwind(AssertUnwindSafe(|| unsafe { destroy(raw) }));
        if result.is_err() {
            tracing::error!("backend panicked while destroying an engine instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_loading_parameters_round_trip() {
        let params = LoadingParameters {
            n_ctx: 2048,
            n_gpu_layers: 100,
            ..Default::default()
        };
        let raw = RawLoadingParameters::from(&params);
        assert_eq!(raw.n_ctx, 2048);
        assert_eq!(raw.n_gpu_layers, 100);
        assert_eq!(raw.n_batch, params.n_batch);
    }

    #[test]
    fn symbol_names_are_nul_terminated() {
        assert_eq!(CREATE_ENGINE_SYMBOL.last(), Some(&0));
        assert_eq!(DESTROY_ENGINE_SYMBOL.last(), Some(&0));
    }
}
