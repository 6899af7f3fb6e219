/*!
Windows GPU detection via WMI (queried through wmic/PowerShell CIM).
*/

use std::process::Command;

use crate::gpu::{vendor_from_description, GpuInfo};
use crate::Result;

pub fn detect_gpus() -> Result<Vec<GpuInfo>> {
    let mut gpus = Vec::new();

    // Win32_VideoController holds one row per display adapter
    if let Ok(output) = Command::new("wmic")
        .args(["path", "Win32_VideoController", "get", "Name,AdapterRAM,DriverVersion", "/format:csv"])
        .output()
    {
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines().skip(1) {
                // CSV rows: Node,AdapterRAM,DriverVersion,Name
                let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
                if parts.len() >= 4 && !parts[3].is_empty() {
                    gpus.push(GpuInfo {
                        vendor: vendor_from_description(parts[3]),
                        name: parts[3].to_string(),
                        vram_mb: parts[1].parse::<u64>().ok().map(|b| b / (1024 * 1024)),
                        driver_version: (!parts[2].is_empty()).then(|| parts[2].to_string()),
                    });
                }
            }
        }
    }

    // wmic is deprecated on recent Windows; retry through PowerShell CIM
    if gpus.is_empty() {
        if let Ok(output) = Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "Get-CimInstance Win32_VideoController | ForEach-Object { $_.Name }",
            ])
            .output()
        {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    gpus.push(GpuInfo {
                        vendor: vendor_from_description(line),
                        name: line.to_string(),
                        vram_mb: None,
                        driver_version: None,
                    });
                }
            }
        }
    }

    Ok(gpus)
}
