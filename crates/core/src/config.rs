use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::job::OutputFormat;

const CONFIG_FILE_NAME: &str = "worker.toml";
const ENV_DATA_DIR: &str = "ESRGAN_WORKER_DATA_DIR";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Long-lived local inference daemon reached over loopback HTTP.
    #[default]
    Daemon,
    /// One CLI invocation per request on temporary files.
    Cli,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daemon => write!(f, "daemon"),
            Self::Cli => write!(f, "cli"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct WorkerConfig {
    pub backend: BackendKind,
    pub server: ServerConfig,
    pub fetch: FetchConfig,
    pub daemon: DaemonConfig,
    pub cli: CliConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub max_concurrent_jobs: usize,
    /// Upper bound on a `/runsync` request body, inline image included.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchConfig {
    /// Zero disables the deadline.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub binary_path: PathBuf,
    pub port: u16,
    pub gpu_id: u32,
    pub model_name: String,
    pub artifact_base_url: String,
    pub artifact_cache_dir: PathBuf,
    /// Upscale factor the engine applies; output resolution is input times this.
    pub scale_factor: u32,
    pub max_input_dimension: u32,
    pub readiness_attempts: u32,
    pub readiness_interval_ms: u64,
    pub readiness_probe_timeout_secs: u64,
    /// Zero disables the deadline.
    pub dispatch_timeout_secs: u64,
    pub default_output_format: OutputFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CliConfig {
    pub binary_env_var: String,
    pub primary_path: PathBuf,
    pub fallback_path: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub default_model: String,
    pub default_scale: u32,
    pub default_output_format: OutputFormat,
    pub max_input_dimension: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
            max_concurrent_jobs: 1,
            max_body_bytes: crate::server::DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/app/real-esrgan-serve"),
            port: 8080,
            gpu_id: 0,
            model_name: "realesrgan-x4plus".to_string(),
            artifact_base_url:
                "https://github.com/ls-ads/real-esrgan-serve/releases/download/v0.1.0".to_string(),
            artifact_cache_dir: PathBuf::from("/workspace"),
            scale_factor: 4,
            max_input_dimension: 1280,
            readiness_attempts: 30,
            readiness_interval_ms: 1000,
            readiness_probe_timeout_secs: 2,
            dispatch_timeout_secs: 0,
            default_output_format: OutputFormat::Jpg,
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary_env_var: "REAL_ESRGAN_BIN".to_string(),
            primary_path: PathBuf::from("/app/realesrgan-ncnn-vulkan"),
            fallback_path: PathBuf::from("./realesrgan-ncnn-vulkan"),
            temp_dir: None,
            default_model: "realesrgan-x4plus".to_string(),
            default_scale: 4,
            default_output_format: OutputFormat::Png,
            max_input_dimension: None,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Option<Duration> {
        non_zero_secs(self.timeout_secs)
    }
}

impl DaemonConfig {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn readiness_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_probe_timeout_secs.max(1))
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.dispatch_timeout_secs)
    }
}

impl CliConfig {
    pub fn resolved_temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl WorkerConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(config)
    }

    /// Rejects settings that would make every job fail at request time.
    pub fn validate(&self) -> Result<()> {
        if self.daemon.default_output_format == OutputFormat::Webp {
            bail!("daemon.default_output_format must be 'png' or 'jpg', got 'webp'");
        }
        Ok(())
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `ESRGAN_WORKER_DATA_DIR`,
/// then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default `worker.toml` if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        WorkerConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}
