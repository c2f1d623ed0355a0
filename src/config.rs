use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::coordination::CoordinatorConfig;
use crate::sync::SyncConfig;
use crate::transport::DEFAULT_RELAY_PREFIX;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Use the native broadcast hub; when false every peer uses the storage relay
    pub native: bool,
    /// Store key prefix for relayed messages
    pub relay_prefix: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            native: true,
            relay_prefix: DEFAULT_RELAY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Directory for the file backend
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StoreConfig {
    /// Directory for the file backend, falling back to the platform data dir
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("tabsync")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log files go here when set
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("transport.native", true)?
            .set_default("coordinator.sweep_interval_ms", 5_000)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TABSYNC_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Environment overrides (TABSYNC_SYNC__NAMESPACE, etc.)
            .add_source(
                Environment::with_prefix("TABSYNC")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values, reporting every problem at once
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.coordinator.sweep_interval_ms == 0 {
            errors.push("coordinator.sweep_interval_ms must be positive".to_string());
        }

        if self.coordinator.history_capacity == 0 {
            errors.push("coordinator.history_capacity must be positive".to_string());
        }

        if self.coordinator.conflict_bucket_ms == 0 {
            errors.push("coordinator.conflict_bucket_ms must be positive".to_string());
        }

        if self.sync.timer_resolution_ms == 0 {
            errors.push("sync.timer_resolution_ms must be positive".to_string());
        }

        if self.sync.namespace.is_empty() {
            errors.push("sync.namespace must not be empty".to_string());
        }

        if self.transport.relay_prefix.is_empty() {
            errors.push("transport.relay_prefix must not be empty".to_string());
        } else if self.transport.relay_prefix.starts_with(&self.sync.state_prefix()) {
            errors.push("transport.relay_prefix must not overlap the state namespace".to_string());
        }

        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            errors.push(format!("unknown logging.level: {}", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
