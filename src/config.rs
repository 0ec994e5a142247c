//! Configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chat::ChatConfig;
use crate::events::DEFAULT_WORKER_PERMITS;
use crate::tasks::TaskRegistryConfig;

/// Main coordination-core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus tuning
    pub bus: BusConfig,

    /// Task retention tuning
    pub tasks: TasksConfig,

    /// Chat controller tuning
    pub chat: ChatSection,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .companion.yml
        let local_config = PathBuf::from(".companion.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/companion/companion.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("companion").join("companion.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Event bus tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Concurrent handler invocations across the bus
    #[serde(rename = "worker-permits")]
    pub worker_permits: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_permits: DEFAULT_WORKER_PERMITS,
        }
    }
}

/// Task retention tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Records older than this are evicted, in seconds
    #[serde(rename = "max-age-secs")]
    pub max_age_secs: u64,

    /// Eviction runs at most once per interval, in seconds
    #[serde(rename = "cleanup-interval-secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 86_400,
            cleanup_interval_secs: 3_600,
        }
    }
}

impl From<&TasksConfig> for TaskRegistryConfig {
    fn from(section: &TasksConfig) -> Self {
        Self {
            max_age: Duration::from_secs(section.max_age_secs),
            cleanup_interval: Duration::from_secs(section.cleanup_interval_secs),
        }
    }
}

/// Chat controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    /// LLM generation budget in seconds
    #[serde(rename = "generate-timeout-secs")]
    pub generate_timeout_secs: u64,

    /// Settings and availability lookup budget in seconds
    #[serde(rename = "settings-timeout-secs")]
    pub settings_timeout_secs: u64,

    /// Canned reply returned when generation fails
    pub apology: Option<String>,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            generate_timeout_secs: 600,
            settings_timeout_secs: 5,
            apology: None,
        }
    }
}

impl From<&ChatSection> for ChatConfig {
    fn from(section: &ChatSection) -> Self {
        let defaults = ChatConfig::default();
        Self {
            generate_timeout: Duration::from_secs(section.generate_timeout_secs),
            settings_timeout: Duration::from_secs(section.settings_timeout_secs),
            apology: section.apology.clone().unwrap_or(defaults.apology),
        }
    }
}
