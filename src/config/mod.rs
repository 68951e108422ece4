//! Application configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! [`Config`].

mod storage;

use std::time::Duration;

use serde::Deserialize;

pub use storage::{Layout, MongodbConfig, StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTLINE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTLINE";

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Change-feed tailing configuration.
    pub tail: TailConfig,
}

/// Change-feed tailing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Delay before reopening a failed change stream, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Capacity of each subscription's delivery channel.
    pub buffer: usize,
    /// Capacity of the shared error channel.
    pub error_buffer: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 1000,
            buffer: 256,
            error_buffer: 10,
        }
    }
}

impl TailConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: in-memory storage, fast reconnects.
    pub fn for_test() -> Self {
        Self {
            tail: TailConfig {
                reconnect_interval_ms: 10,
                ..TailConfig::default()
            },
            ..Self::default()
        }
    }
}
