use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::db::PoolError;

/// Main configuration structure for docstore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

/// Backing store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Schema class holding the key-value entries
    pub collection: String,
    /// Entity classes registered with object-mode sessions at setup
    pub object_classes: Vec<String>,
}

/// Sizing and timing of each session pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: u32,
    pub max_size: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    /// Keep retrying failed session opens until the connection timeout
    pub retry_connection: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "memory:docstore".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            collection: "keyValue".to_string(),
            object_classes: Vec::new(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            connection_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            retry_connection: false,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> std::result::Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::Configuration(
                "pool max_size must be greater than zero".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Configuration(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(), // pretty, json, compact
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. DOCSTORE_URL / DOCSTORE_USERNAME / DOCSTORE_PASSWORD
    /// 2. Environment variables (DOCSTORE_<SECTION>__<KEY>)
    /// 3. config.toml file (if exists)
    /// 4. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&std::env::current_dir()?)
    }

    /// Load configuration from a specific directory
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        let config_file = dir.join("config.toml");
        if config_file.exists() {
            builder = builder.add_source(File::from(config_file));
        }

        builder = builder.add_source(
            Environment::with_prefix("DOCSTORE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("Failed to build configuration")?;

        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        result.merge_env_vars();
        result
            .pool
            .validate()
            .context("Invalid pool configuration")?;

        Ok(result)
    }

    /// Create a new Config for testing
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            store: StoreConfig {
                url: "memory:test".to_string(),
                username: "test".to_string(),
                password: "test".to_string(),
                collection: "keyValue".to_string(),
                object_classes: Vec::new(),
            },
            pool: PoolConfig {
                min_size: 1,
                max_size: 2,
                connection_timeout_secs: 1,
                ..PoolConfig::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    /// Short-form connection variables win over everything else
    fn merge_env_vars(&mut self) {
        if let Ok(url) = std::env::var("DOCSTORE_URL") {
            self.store.url = url;
        }
        if let Ok(username) = std::env::var("DOCSTORE_USERNAME") {
            self.store.username = username;
        }
        if let Ok(password) = std::env::var("DOCSTORE_PASSWORD") {
            self.store.password = password;
        }
    }
}
