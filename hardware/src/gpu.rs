/*!
GPU Detection

Detects GPU vendor and capabilities for acceleration selection.
*/

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nvidia => write!(f, "NVIDIA"),
            Self::Amd => write!(f, "AMD"),
            Self::Intel => write!(f, "Intel"),
            Self::Apple => write!(f, "Apple"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl GpuVendor {
    /// Integrated-only vendors never count as dedicated hardware.
    pub fn is_dedicated_class(self) -> bool {
        matches!(self, Self::Nvidia | Self::Amd)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: GpuVendor,
    pub name: String,
    pub vram_mb: Option<u64>,
    pub driver_version: Option<String>,
}

/// Detect GPUs using platform-specific methods
pub fn detect_gpus() -> Result<Vec<GpuInfo>> {
    #[cfg(target_os = "windows")]
    {
        crate::platform_windows::detect_gpus()
    }

    #[cfg(target_os = "linux")]
    {
        crate::platform_linux::detect_gpus()
    }

    #[cfg(target_os = "macos")]
    {
        crate::platform_macos::detect_gpus()
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        Ok(Vec::new())
    }
}

/// Whether the host has a dedicated GPU suitable for Vulkan acceleration.
///
/// Apple hosts report `true` (Metal is assumed available on Apple
/// Silicon). Elsewhere, NVIDIA and AMD adapters count; Intel integrated
/// graphics does not.
pub fn has_dedicated_gpu() -> bool {
    #[cfg(target_os = "macos")]
    {
        return true;
    }

    #[cfg(not(target_os = "macos"))]
    {
        #[cfg(target_os = "linux")]
        if crate::platform_linux::has_dedicated_gpu_modules() {
            return true;
        }

        match detect_gpus() {
            Ok(gpus) => gpus.iter().any(|g| g.vendor.is_dedicated_class()),
            Err(e) => {
                tracing::warn!("GPU detection failed, assuming no dedicated GPU: {}", e);
                false
            }
        }
    }
}

/// Classify a device description line by vendor keyword.
pub(crate) fn vendor_from_description(description: &str) -> GpuVendor {
    use crate::constants::*;

    let lower = description.to_lowercase();
    if lower.contains(GPU_KEYWORD_NVIDIA) {
        GpuVendor::Nvidia
    } else if lower.contains(GPU_KEYWORD_AMD)
        || lower.contains(GPU_KEYWORD_ATI)
        || lower.contains(GPU_KEYWORD_RADEON)
    {
        GpuVendor::Amd
    } else if lower.contains(GPU_KEYWORD_INTEL) {
        GpuVendor::Intel
    } else if lower.contains(GPU_KEYWORD_APPLE) {
        GpuVendor::Apple
    } else {
        GpuVendor::Unknown
    }
}
