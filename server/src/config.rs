//! Server configuration: TOML file, CLI flags and the opt-in
//! persistence hook used by the engine coordinator.

use std::path::{Path, PathBuf};

use clap::Parser;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kolosal_engines::{ModelPersistence, PersistedModel};
use kolosal_inference::{BackendConfig, LoadingParameters};

/// Opt-in switch for writing configuration changes back to disk.
pub const ALLOW_CONFIG_SAVE_ENV: &str = "KOLOSAL_ALLOW_CONFIG_SAVE";

#[derive(Debug, Parser)]
#[command(name = "kolosal-server", version, about = "OpenAI-compatible inference server")]
pub struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "KOLOSAL_CONFIG", default_value = "config.toml")]
    pub config: PathBuf,

    /// Override the configured listen port
    #[arg(short, long, env = "KOLOSAL_PORT")]
    pub port: Option<u16>,

    /// Override the configured models directory
    #[arg(long, env = "KOLOSAL_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    /// Override the idle timeout (seconds) for engine unloading
    #[arg(long, env = "KOLOSAL_IDLE_TIMEOUT")]
    pub idle_timeout_secs: Option<u64>,

    /// Log filter, e.g. "kolosal=debug"
    #[arg(long, env = "KOLOSAL_LOG", default_value = "kolosal=info,tower_http=warn")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub idle_timeout_secs: u64,
    pub models_dir: PathBuf,
    pub download_retention_minutes: i64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            idle_timeout_secs: 300,
            models_dir: default_models_dir(),
            download_retention_minutes: 60,
        }
    }
}

fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("kolosal").join("models"))
        .unwrap_or_else(|| PathBuf::from("./models"))
}

/// One persisted model entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub id: String,
    pub path: String,
    #[serde(default = "default_true")]
    pub load_immediately: bool,
    #[serde(default = "default_gpu_id")]
    pub main_gpu_id: i32,
    #[serde(default)]
    pub load_params: LoadingParameters,
    #[serde(default)]
    pub inference_engine: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_gpu_id() -> i32 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub models: Vec<ModelEntry>,
    pub inference_engines: Vec<BackendConfig>,
    pub default_inference_engine: Option<String>,
}

impl ServerConfig {
    /// Load the config file, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents)?;
                tracing::info!(path = %path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(models_dir) = &args.models_dir {
            self.server.models_dir = models_dir.clone();
        }
        if let Some(secs) = args.idle_timeout_secs {
            self.server.idle_timeout_secs = secs;
        }
    }
}

/// Whether configuration writes are permitted: either the opt-in env
/// var is set, or the target file already exists and is writable.
pub fn config_writes_allowed(path: &Path) -> bool {
    if std::env::var(ALLOW_CONFIG_SAVE_ENV).map(|v| v == "1").unwrap_or(false) {
        return true;
    }
    std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .is_ok()
}

/// Best-effort model persistence backed by the config file.
///
/// Skips silently when writes are not permitted; request handling never
/// depends on the outcome.
pub struct ConfigPersistence {
    path: PathBuf,
    config: Mutex<ServerConfig>,
}

impl ConfigPersistence {
    pub fn new(path: PathBuf, config: ServerConfig) -> Self {
        Self {
            path,
            config: Mutex::new(config),
        }
    }

    fn save(&self, config: &ServerConfig) {
        if let Err(e) = config.save_to(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to save configuration");
        }
    }
}

impl ModelPersistence for ConfigPersistence {
    fn persist_model(&self, model: &PersistedModel) {
        if !config_writes_allowed(&self.path) {
            tracing::debug!(
                model_id = %model.id,
                "Skipping config write (set {}=1 to force; path not writable)",
                ALLOW_CONFIG_SAVE_ENV
            );
            return;
        }

        let mut config = self.config.lock();
        let entry = ModelEntry {
            id: model.id.clone(),
            path: model.path.clone(),
            load_immediately: model.load_immediately,
            main_gpu_id: model.main_gpu_id,
            load_params: model.load_params.clone(),
            inference_engine: Some(model.backend_name.clone()),
        };
        match config.models.iter_mut().find(|m| m.id == model.id) {
            Some(existing) => *existing = entry,
            None => config.models.push(entry),
        }
        self.save(&config);
        tracing::info!(model_id = %model.id, "Persisted model to configuration");
    }

    fn remove_model(&self, engine_id: &str) {
        if !config_writes_allowed(&self.path) {
            return;
        }
        let mut config = self.config.lock();
        let before = config.models.len();
        config.models.retain(|m| m.id != engine_id);
        if config.models.len() != before {
            self.save(&config);
            tracing::info!(model_id = engine_id, "Removed model from configuration");
        }
    }
}
