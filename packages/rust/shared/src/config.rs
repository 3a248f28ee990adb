//! Application configuration for relingo.
//!
//! User config lives at `~/.relingo/relingo.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelingoError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "relingo.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".relingo";

// ---------------------------------------------------------------------------
// Config structs (matching relingo.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub circuit: CircuitSection,

    #[serde(default)]
    pub transform: TransformSection,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Path to the libSQL database file. A leading `~/` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.relingo/relingo.db".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Maximum number of jobs with a non-terminal chunk.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u32,

    /// Change events processed concurrently by one worker.
    #[serde(default = "default_max_concurrent_invocations")]
    pub max_concurrent_invocations: u32,

    /// Wall-clock bound for one orchestrator/barrier invocation.
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,

    /// Sleep between polls when there is nothing to do.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a claimed change event stays invisible before redelivery.
    #[serde(default = "default_event_lease_secs")]
    pub event_lease_secs: u64,

    /// How long a claimed dispatch message stays invisible before redelivery.
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,

    /// Deliveries after which an event or dispatch message is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Deepest heading level (1-6) that starts a new chunk.
    #[serde(default = "default_max_heading_level")]
    pub max_heading_level: u8,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            max_concurrent_invocations: default_max_concurrent_invocations(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            event_lease_secs: default_event_lease_secs(),
            job_lease_secs: default_job_lease_secs(),
            max_deliveries: default_max_deliveries(),
            max_heading_level: default_max_heading_level(),
        }
    }
}

fn default_concurrency_limit() -> u32 {
    4
}
fn default_max_concurrent_invocations() -> u32 {
    8
}
fn default_invocation_timeout_secs() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_event_lease_secs() -> u64 {
    300
}
fn default_job_lease_secs() -> u64 {
    60
}
fn default_max_deliveries() -> u32 {
    5
}
fn default_max_heading_level() -> u8 {
    6
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Failures at which a chunk is escalated.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay for transient failures.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// First retry delay for rate-limited failures.
    #[serde(default = "default_rate_limited_base_delay_ms")]
    pub rate_limited_base_delay_ms: u64,

    /// Growth factor applied per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            rate_limited_base_delay_ms: default_rate_limited_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_rate_limited_base_delay_ms() -> u64 {
    60_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    600_000
}

/// `[circuit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSection {
    /// Rate-limit signals within the window that open the breaker.
    #[serde(default = "default_trip_after")]
    pub trip_after: u32,

    /// Sliding window length.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            trip_after: default_trip_after(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_trip_after() -> u32 {
    10
}
fn default_window_secs() -> u64 {
    300
}

/// `[transform]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSection {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model ID used for every stage.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TransformSection {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-3.5-turbo-1106".into()
}
fn default_request_timeout_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub concurrency_limit: u32,
    pub max_concurrent_invocations: u32,
    pub invocation_timeout: Duration,
    pub poll_interval: Duration,
    pub event_lease: Duration,
    pub job_lease: Duration,
    pub max_deliveries: u32,
    pub max_heading_level: u8,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            concurrency_limit: p.concurrency_limit,
            max_concurrent_invocations: p.max_concurrent_invocations.max(1),
            invocation_timeout: Duration::from_secs(p.invocation_timeout_secs),
            poll_interval: Duration::from_millis(p.poll_interval_ms),
            event_lease: Duration::from_secs(p.event_lease_secs),
            job_lease: Duration::from_secs(p.job_lease_secs),
            max_deliveries: p.max_deliveries.max(1),
            max_heading_level: p.max_heading_level.clamp(1, 6),
        }
    }
}

/// Runtime retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub rate_limited_base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl From<&AppConfig> for RetryConfig {
    fn from(config: &AppConfig) -> Self {
        let r = &config.retry;
        Self {
            max_attempts: r.max_attempts.max(1),
            base_delay: Duration::from_millis(r.base_delay_ms),
            rate_limited_base_delay: Duration::from_millis(r.rate_limited_base_delay_ms),
            multiplier: r.multiplier,
            max_delay: Duration::from_millis(r.max_delay_ms),
        }
    }
}

/// Runtime circuit-breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub trip_after: u32,
    pub window: Duration,
}

impl From<&AppConfig> for CircuitConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            trip_after: config.circuit.trip_after,
            window: Duration::from_secs(config.circuit.window_secs),
        }
    }
}

/// Runtime transform-service configuration (API key resolved from the environment).
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl TransformConfig {
    /// Resolve the runtime transform config, reading the API key from the configured env var.
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        validate_api_key(config)?;
        let api_key = std::env::var(&config.transform.api_key_env).unwrap_or_default();
        Ok(Self {
            api_key,
            base_url: config.transform.base_url.trim_end_matches('/').to_string(),
            model: config.transform.model.clone(),
            request_timeout: Duration::from_secs(config.transform.request_timeout_secs),
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.relingo/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RelingoError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.relingo/relingo.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RelingoError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| RelingoError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RelingoError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RelingoError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RelingoError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Resolve `[storage] db_path`, expanding a leading `~/`.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    let raw = &config.storage.db_path;
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| RelingoError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

/// Check that the transform API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.transform.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(RelingoError::config(format!(
            "transform API key not found. Set the {var_name} environment variable."
        ))),
    }
}
