//! Configuration for the gateway.
//!
//! Built once at startup and handed to each component explicitly, so tests can
//! run several independently configured gateways in one process.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub auto_switch: AutoSwitchConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    /// Backends keyed by model name.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path, `sqlite:` prefix optional, `:memory:` for ephemeral.
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Admission queue limits and policies, shared by every model.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Secondary tier capacity per model.
    #[serde(default = "default_max_waiting")]
    pub max_waiting: usize,
    /// Primary tier capacity for models that do not set their own.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,
    /// Deadline measured from submission.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before a transient failure is requeued. 0 = immediate.
    #[serde(default)]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl QueueConfig {
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_secs as i64)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_waiting: default_max_waiting(),
            default_max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: 0,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// Consecutive probe failures before a running backend is declared crashed.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_startup_poll_ms")]
    pub startup_poll_ms: u64,
    /// Time a terminated process gets before it is killed.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// How long a graceful stop waits for in-flight work.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Start again on boot the backends that were up before a restart.
    #[serde(default = "default_true")]
    pub restore_running: bool,
}

impl LifecycleConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
            startup_timeout_secs: default_startup_timeout(),
            startup_poll_ms: default_startup_poll_ms(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            stop_grace_secs: default_stop_grace(),
            restore_running: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoSwitchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_switch_interval")]
    pub interval_secs: u64,
    /// Rolling usage window.
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    /// A stopped model is started once its window count exceeds this.
    #[serde(default = "default_start_threshold")]
    pub start_threshold: u64,
    /// Gracefully stop idle running models with low usage.
    #[serde(default)]
    pub auto_stop: bool,
    /// Running models below this window count are auto-stop candidates.
    #[serde(default = "default_stop_threshold")]
    pub stop_threshold: u64,
    /// Minimum time between two decisions for the same model.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl AutoSwitchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::days(self.window_days)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

impl Default for AutoSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_switch_interval(),
            window_days: default_window_days(),
            start_threshold: default_start_threshold(),
            auto_stop: false,
            stop_threshold: default_stop_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

impl HistoryConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

/// One inference backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the backend's HTTP API (e.g. "http://127.0.0.1:8001").
    pub base_url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_completion_path")]
    pub completion_path: String,
    /// Primary tier capacity; falls back to `queue.default_max_concurrent`.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Launch command. Without one the backend is managed externally.
    #[serde(default)]
    pub command: Option<String>,
    /// Launch arguments; `{port}` and `{resolution}` are substituted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Allowed resolution variant tags. Empty = no variants.
    #[serde(default)]
    pub resolution_modes: Vec<String>,
    #[serde(default)]
    pub default_resolution: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ModelConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            health_path: default_health_path(),
            completion_path: default_completion_path(),
            max_concurrent: None,
            enabled: true,
            command: None,
            args: vec![],
            resolution_modes: vec![],
            default_resolution: None,
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn max_concurrent(&self, queue: &QueueConfig) -> usize {
        self.max_concurrent.unwrap_or(queue.default_max_concurrent)
    }

    pub fn supports_resolution(&self, mode: &str) -> bool {
        self.resolution_modes.iter().any(|m| m == mode)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_database_url() -> String {
    "sqlite:./data/modelgate.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_waiting() -> usize {
    10
}
fn default_max_concurrent() -> usize {
    10
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_sweep_interval() -> u64 {
    2
}
fn default_health_interval() -> u64 {
    10
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_startup_timeout() -> u64 {
    120
}
fn default_startup_poll_ms() -> u64 {
    500
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_stop_grace() -> u64 {
    60
}
fn default_switch_interval() -> u64 {
    300
}
fn default_window_days() -> i64 {
    7
}
fn default_start_threshold() -> u64 {
    10
}
fn default_stop_threshold() -> u64 {
    1
}
fn default_cooldown() -> u64 {
    300
}
fn default_retention_days() -> i64 {
    15
}
fn default_prune_interval() -> u64 {
    86_400
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_completion_path() -> String {
    "/v1/completions".to_string()
}
fn default_request_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (MODELGATE__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config: Config = ConfigLoader::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("MODELGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break queue or lifecycle invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_waiting == 0 {
            return Err(ConfigError::Invalid("queue.max_waiting must be > 0".to_string()));
        }
        if self.queue.timeout_secs == 0 {
            return Err(ConfigError::Invalid("queue.timeout_secs must be > 0".to_string()));
        }
        if self.lifecycle.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.failure_threshold must be > 0".to_string(),
            ));
        }

        for (name, model) in &self.models {
            if model.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("models.{}.base_url is empty", name)));
            }
            if model.max_concurrent(&self.queue) == 0 {
                return Err(ConfigError::Invalid(format!(
                    "models.{}.max_concurrent must be > 0",
                    name
                )));
            }
            if let Some(ref mode) = model.default_resolution {
                if !model.supports_resolution(mode) {
                    return Err(ConfigError::Invalid(format!(
                        "models.{}.default_resolution '{}' is not in resolution_modes",
                        name, mode
                    )));
                }
            }
        }

        Ok(())
    }

    /// Enabled models, sorted by name.
    pub fn enabled_models(&self) -> Vec<(&String, &ModelConfig)> {
        let mut models: Vec<_> = self.models.iter().filter(|(_, m)| m.enabled).collect();
        models.sort_by(|a, b| a.0.cmp(b.0));
        models
    }
}
