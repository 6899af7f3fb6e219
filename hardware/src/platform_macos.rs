/*!
macOS GPU detection. Apple hosts are assumed Metal-capable.
*/

use std::process::Command;

use crate::gpu::{vendor_from_description, GpuInfo, GpuVendor};
use crate::Result;

pub fn detect_gpus() -> Result<Vec<GpuInfo>> {
    // system_profiler is slow but authoritative; fall back to a generic
    // Apple entry when it is unavailable.
    if let Ok(output) = Command::new("system_profiler")
        .args(["SPDisplaysDataType", "-detailLevel", "mini"])
        .output()
    {
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let gpus: Vec<GpuInfo> = stdout
                .lines()
                .filter_map(|line| {
                    let line = line.trim();
                    line.strip_prefix("Chipset Model:").map(|name| {
                        let name = name.trim().to_string();
                        let vendor = match vendor_from_description(&name) {
                            GpuVendor::Unknown => GpuVendor::Apple,
                            v => v,
                        };
                        GpuInfo {
                            vendor,
                            name,
                            vram_mb: None,
                            driver_version: None,
                        }
                    })
                })
                .collect();
            if !gpus.is_empty() {
                return Ok(gpus);
            }
        }
    }

    Ok(vec![GpuInfo {
        vendor: GpuVendor::Apple,
        name: "Apple GPU".to_string(),
        vram_mb: None,
        driver_version: None,
    }])
}
