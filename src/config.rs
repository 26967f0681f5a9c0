//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `EVENTHUB_*` environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api;
use crate::pipeline::{PipelineConfig, MAX_RETRY_DELAY};
use crate::websocket::HubConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiSection,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_max_body_size() -> usize {
    2 * 1024 * 1024 // 2 MB
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Event store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Database file name, relative to `data_dir` unless absolute
    #[serde(default = "default_db_file")]
    pub file: String,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("eventhub").to_string_lossy().to_string())
        .unwrap_or_else(|| "./eventhub_data".to_string())
}

fn default_db_file() -> String {
    "events.db".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            file: default_db_file(),
        }
    }
}

impl StoreSection {
    /// Full path of the database file
    pub fn path(&self) -> PathBuf {
        let file = Path::new(&self.file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            expand_home(&self.data_dir).join(file)
        }
    }
}

/// Expand a leading `~/`
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Connection hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound frames buffered per session; further frames are dropped
    #[serde(default = "default_hub_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_max_connections() -> usize {
    1000
}

fn default_hub_queue_capacity() -> usize {
    256
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    54
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            queue_capacity: default_hub_queue_capacity(),
            idle_timeout_secs: default_idle_timeout(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

/// Event pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_pipeline_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Delay of the built-in processor
    #[serde(default = "default_processing_delay")]
    pub processing_delay_ms: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_workers() -> usize {
    4
}

fn default_pipeline_queue_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

fn default_processing_delay() -> u64 {
    100
}

fn default_max_batch_size() -> usize {
    100
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_pipeline_queue_capacity(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
            processing_delay_ms: default_processing_delay(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load an explicit file, or fall back to the default locations
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::load_with_env(path)?,
            None => Self::load_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("eventhub").join("config.toml")),
            Some(PathBuf::from("/etc/eventhub/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!(path = ?path, "Loaded config");
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(path = ?path, error = %e, "Failed to load config");
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = var(key)?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
                    None
                }
            }
        }

        // Store
        if let Some(data_dir) = var("EVENTHUB_DATA_DIR") {
            self.store.data_dir = data_dir;
        }
        if let Some(file) = var("EVENTHUB_DB_FILE") {
            self.store.file = file;
        }

        // API
        if let Some(host) = var("EVENTHUB_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = parsed(&var, "EVENTHUB_API_PORT") {
            self.api.port = port;
        }

        // Hub
        if let Some(max) = parsed(&var, "EVENTHUB_HUB_MAX_CONNECTIONS") {
            self.hub.max_connections = max;
        }
        if let Some(capacity) = parsed(&var, "EVENTHUB_HUB_QUEUE_CAPACITY") {
            self.hub.queue_capacity = capacity;
        }

        // Pipeline
        if let Some(workers) = parsed(&var, "EVENTHUB_PIPELINE_WORKERS") {
            self.pipeline.workers = workers;
        }
        if let Some(attempts) = parsed(&var, "EVENTHUB_PIPELINE_MAX_ATTEMPTS") {
            self.pipeline.max_attempts = attempts;
        }
        if let Some(delay) = parsed(&var, "EVENTHUB_PIPELINE_RETRY_DELAY_SECS") {
            self.pipeline.retry_delay_secs = delay;
        }

        // Logging
        if let Some(level) = var("EVENTHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("EVENTHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.hub.max_connections == 0, "hub.max_connections must be > 0"),
            (self.hub.queue_capacity == 0, "hub.queue_capacity must be > 0"),
            (self.hub.ping_interval_secs == 0, "hub.ping_interval_secs must be > 0"),
            (self.hub.idle_timeout_secs == 0, "hub.idle_timeout_secs must be > 0"),
            (self.pipeline.workers == 0, "pipeline.workers must be > 0"),
            (self.pipeline.queue_capacity == 0, "pipeline.queue_capacity must be > 0"),
            (self.pipeline.max_batch_size == 0, "pipeline.max_batch_size must be > 0"),
            (
                self.pipeline.retry_delay_secs > MAX_RETRY_DELAY.as_secs(),
                "pipeline.retry_delay_secs must be at most 604800 (7 days)",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid(message.to_string())),
            None => Ok(()),
        }
    }

    pub fn api_config(&self) -> api::ApiConfig {
        api::ApiConfig {
            host: self.api.host.clone(),
            port: self.api.port,
            max_body_size: self.api.max_body_size,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.hub.max_connections,
            queue_capacity: self.hub.queue_capacity,
            idle_timeout: Duration::from_secs(self.hub.idle_timeout_secs),
            ping_interval: Duration::from_secs(self.hub.ping_interval_secs),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.pipeline.workers,
            queue_capacity: self.pipeline.queue_capacity,
            max_attempts: self.pipeline.max_attempts,
            retry_delay: Duration::from_secs(self.pipeline.retry_delay_secs),
            max_batch_size: self.pipeline.max_batch_size,
        }
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.pipeline.processing_delay_ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Eventhub Configuration
#
# Environment variables override these settings:
# - EVENTHUB_DATA_DIR, EVENTHUB_DB_FILE
# - EVENTHUB_API_HOST, EVENTHUB_API_PORT
# - EVENTHUB_HUB_MAX_CONNECTIONS, EVENTHUB_HUB_QUEUE_CAPACITY
# - EVENTHUB_PIPELINE_WORKERS, EVENTHUB_PIPELINE_MAX_ATTEMPTS
# - EVENTHUB_PIPELINE_RETRY_DELAY_SECS
# - EVENTHUB_LOG_LEVEL, EVENTHUB_LOG_FORMAT

[api]
# API server host
host = "0.0.0.0"

# API server port
port = 8090

# Maximum request body size (bytes)
max_body_size = 2097152

[store]
# Directory holding the event database
data_dir = "~/.local/share/eventhub"

# SQLite file name (relative to data_dir unless absolute)
file = "events.db"

[hub]
# Maximum concurrent WebSocket sessions
max_connections = 1000

# Frames buffered per session; when full, new frames are dropped
queue_capacity = 256

# Close sessions silent for this long (seconds)
idle_timeout_secs = 60

# Ping interval (seconds)
ping_interval_secs = 54

[pipeline]
# Processing workers
workers = 4

# Jobs waiting for a worker; when full, events stay pending
queue_capacity = 1024

# Default retry budget per event
max_attempts = 3

# Default delay before a retry runs (seconds)
retry_delay_secs = 60

# Delay of the built-in processor (milliseconds)
processing_delay_ms = 100

# Largest publish or delete batch
max_batch_size = 100

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.port, 8090);
        assert_eq!(config.hub.queue_capacity, 256);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.retry_delay_secs, 60);
        assert_eq!(config.pipeline.max_batch_size, 100);
        assert!(config.store.path().ends_with("events.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_template_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.hub.ping_interval_secs, 54);
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline]\nworkers = 8\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.queue_capacity, 1024);
        assert_eq!(config.api.port, 8090);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Io { .. })));

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[api\nport = ").unwrap();
        assert!(matches!(Config::load(&broken), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EVENTHUB_API_PORT", "9000"),
            ("EVENTHUB_HUB_QUEUE_CAPACITY", "64"),
            ("EVENTHUB_PIPELINE_WORKERS", "not-a-number"),
            ("EVENTHUB_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.api.port, 9000);
        assert_eq!(config.hub.queue_capacity, 64);
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.pipeline.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_huge_retry_delay() {
        let mut config = Config::default();
        config.pipeline.retry_delay_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_store_path_absolute_file() {
        let store = StoreSection {
            data_dir: "/var/lib/eventhub".to_string(),
            file: "/tmp/other.db".to_string(),
        };
        assert_eq!(store.path(), PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_runtime_configs() {
        let config = Config::default();
        assert_eq!(config.hub_config().idle_timeout, Duration::from_secs(60));
        assert_eq!(config.pipeline_config().retry_delay, Duration::from_secs(60));
        assert_eq!(config.api_config().addr(), "0.0.0.0:8090");
        assert_eq!(config.processing_delay(), Duration::from_millis(100));
    }
}
