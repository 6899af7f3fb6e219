/*!
Linux GPU detection using /proc/modules, /sys/class/drm and lspci.
*/

use std::fs;
use std::process::Command;

use crate::constants::*;
use crate::gpu::{vendor_from_description, GpuInfo, GpuVendor};
use crate::Result;

/// Fast path: a dedicated GPU kernel module is loaded.
pub fn has_dedicated_gpu_modules() -> bool {
    let Ok(modules) = fs::read_to_string("/proc/modules") else {
        return false;
    };

    modules.lines().any(|line| {
        line.split_whitespace()
            .next()
            .map(|name| DEDICATED_GPU_MODULES.contains(&name))
            .unwrap_or(false)
    })
}

pub fn detect_gpus() -> Result<Vec<GpuInfo>> {
    let mut gpus = Vec::new();

    // Try nvidia-smi first: it gives name, VRAM and driver in one query
    if let Ok(output) = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,driver_version",
            "--format=csv,noheader,nounits",
        ])
        .output()
    {
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines() {
                let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
                if parts.len() >= 3 {
                    gpus.push(GpuInfo {
                        vendor: GpuVendor::Nvidia,
                        name: parts[0].to_string(),
                        vram_mb: parts[1].parse().ok(),
                        driver_version: Some(parts[2].to_string()),
                    });
                }
            }
        }
    }

    // /sys/class/drm exposes one cardN directory per adapter
    if gpus.is_empty() {
        if let Ok(entries) = fs::read_dir("/sys/class/drm") {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with("card") || name.contains('-') {
                    continue;
                }
                let vendor_path = entry.path().join("device/vendor");
                if let Ok(vendor_id) = fs::read_to_string(&vendor_path) {
                    let vendor = match vendor_id.trim() {
                        "0x10de" => GpuVendor::Nvidia,
                        "0x1002" => GpuVendor::Amd,
                        "0x8086" => GpuVendor::Intel,
                        _ => GpuVendor::Unknown,
                    };
                    gpus.push(GpuInfo {
                        vendor,
                        name: format!("DRM device {}", name),
                        vram_mb: None,
                        driver_version: None,
                    });
                }
            }
        }
    }

    // Fall back to lspci text output
    if gpus.is_empty() {
        if let Ok(output) = Command::new("lspci").output() {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                for line in stdout.lines() {
                    let line_lower = line.to_lowercase();
                    if line_lower.contains(KEYWORD_VGA)
                        || line_lower.contains(KEYWORD_3D)
                        || line_lower.contains(KEYWORD_DISPLAY)
                    {
                        let name = line
                            .splitn(3, ':')
                            .nth(2)
                            .map(|s| s.trim().to_string())
                            .unwrap_or_else(|| line.to_string());
                        gpus.push(GpuInfo {
                            vendor: vendor_from_description(line),
                            name,
                            vram_mb: None,
                            driver_version: None,
                        });
                    }
                }
            }
        }
    }

    Ok(gpus)
}
