//! System memory detection via sysinfo, used by health reporting.

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_ram_mb: u64,
    pub available_ram_mb: u64,
}

pub fn detect_memory() -> Result<MemoryInfo> {
    let mut sys = System::new();
    sys.refresh_memory();

    Ok(MemoryInfo {
        total_ram_mb: sys.total_memory() / (1024 * 1024),
        available_ram_mb: sys.available_memory() / (1024 * 1024),
    })
}
