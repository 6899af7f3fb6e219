//! Keyword tables used when parsing detection tool output.

// Substrings that mark a PCI device line as a display adapter
pub const KEYWORD_VGA: &str = "vga";
pub const KEYWORD_3D: &str = "3d controller";
pub const KEYWORD_DISPLAY: &str = "display controller";

// Vendor keywords (lower-cased match)
pub const GPU_KEYWORD_NVIDIA: &str = "nvidia";
pub const GPU_KEYWORD_AMD: &str = "amd";
pub const GPU_KEYWORD_ATI: &str = "ati";
pub const GPU_KEYWORD_RADEON: &str = "radeon";
pub const GPU_KEYWORD_INTEL: &str = "intel";
pub const GPU_KEYWORD_APPLE: &str = "apple";

// Kernel modules that indicate a dedicated GPU driver is loaded (Linux)
pub const DEDICATED_GPU_MODULES: &[&str] = &["nvidia", "amdgpu", "radeon", "nouveau"];
