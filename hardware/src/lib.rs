/*!
Hardware detection for backend selection.

Detects GPUs and system memory so the engine coordinator can pick a
sensible default inference backend (Metal on Apple hosts, Vulkan when a
dedicated GPU is present, CPU otherwise). Detection never requires the
hardware to actually be usable; it only informs defaults.
*/

use thiserror::Error;

mod constants;
pub mod gpu;
mod memory;

#[cfg(target_os = "linux")]
mod platform_linux;
#[cfg(target_os = "macos")]
mod platform_macos;
#[cfg(target_os = "windows")]
mod platform_windows;

pub use gpu::{detect_gpus, has_dedicated_gpu, GpuInfo, GpuVendor};
pub use memory::{detect_memory, MemoryInfo};

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("GPU detection error: {0}")]
    GpuDetection(String),

    #[error("Memory detection error: {0}")]
    MemoryDetection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HardwareError>;

/// Capability probe consumed by the engine coordinator.
///
/// Implemented for closures so tests can substitute a fixed answer
/// instead of touching the host machine.
pub trait GpuProbe: Send + Sync {
    /// Whether the host has a dedicated (discrete) GPU suitable for
    /// Vulkan-class acceleration.
    fn has_dedicated_gpu(&self) -> bool;
}

impl<F> GpuProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn has_dedicated_gpu(&self) -> bool {
        self()
    }
}

/// Probe backed by real platform detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemGpuProbe;

impl GpuProbe for SystemGpuProbe {
    fn has_dedicated_gpu(&self) -> bool {
        has_dedicated_gpu()
    }
}
