//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use batchflow_core::RetryPolicy;
use serde::Deserialize;

/// Global configuration for batchflow
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub simulate: SimulateConfig,
    pub retry: RetryConfig,
}

/// Defaults for `batchflow simulate`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulateConfig {
    pub items: usize,
    pub interval_ms: u64,
    pub worker_ms: u64,
    pub results_per_batch: usize,
    /// Fail every Nth worker attempt
    pub flaky_every: Option<usize>,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            items: 200,
            interval_ms: 10,
            worker_ms: 50,
            results_per_batch: 1,
            flaky_every: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./batchflow.toml (current directory)
    /// 2. ~/.config/batchflow/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("batchflow.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "batchflow") {
            let user_config = dirs.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
