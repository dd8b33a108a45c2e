//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::majority;
use crate::lock::types::{
    DEFAULT_CLOCK_DRIFT_FACTOR, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY,
};
use crate::lock::{CoordinatorConfig, LockCoordinator};
use crate::store::{LockStore, open_store};

/// Default per-operation store timeout
const DEFAULT_STORE_TIMEOUT_MS: u64 = 50;

/// Keys accepted by [`Config::get`] and [`Config::set`]
pub const CONFIG_KEYS: &[&str] = &[
    "lock.quorum",
    "lock.retry_count",
    "lock.retry_delay_ms",
    "lock.clock_drift_factor",
    "lock.default_ttl_ms",
    "stores",
    "stores.timeout_ms",
];

/// Redlock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Must be set explicitly; there is no implicit majority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<usize>,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub clock_drift_factor: f64,
    pub default_ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            quorum: None,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            clock_drift_factor: DEFAULT_CLOCK_DRIFT_FACTOR,
            default_ttl_ms: 10_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock: LockSettings::default(),
            stores: Vec::new(),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("REDLOCK_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("redlock")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default path, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            // Return default config without creating file
            Ok(Config::default())
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Reset the config file at the default path to defaults
    pub fn reset() -> anyhow::Result<()> {
        Config::default().save()
    }

    /// Validate configuration
    ///
    /// A missing quorum is allowed here so that a config can be built up
    /// step by step; it is rejected when a coordinator is created.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lock.retry_count == 0 {
            return Err(anyhow!("lock.retry_count must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.lock.clock_drift_factor) {
            return Err(anyhow!("lock.clock_drift_factor must be within [0, 1)"));
        }
        if self.lock.default_ttl_ms == 0 {
            return Err(anyhow!("lock.default_ttl_ms must be positive"));
        }
        if let Some(quorum) = self.lock.quorum {
            if quorum == 0 {
                return Err(anyhow!("lock.quorum must be at least 1"));
            }
            if !self.stores.is_empty() && quorum > self.stores.len() {
                return Err(anyhow!(
                    "lock.quorum ({}) exceeds the number of stores ({})",
                    quorum,
                    self.stores.len()
                ));
            }
        }
        for store in &self.stores {
            if !store.url.contains("://") {
                return Err(anyhow!("Invalid store URL: {}", store.url));
            }
            if store.timeout_ms == 0 {
                return Err(anyhow!("Store timeout for {} must be positive", store.url));
            }
        }
        Ok(())
    }

    /// Quorum a coordinator built from this config would use
    pub fn effective_quorum(&self) -> Option<usize> {
        self.lock.quorum
    }

    /// Majority quorum for the configured stores
    pub fn suggested_quorum(&self) -> usize {
        majority(self.stores.len())
    }

    /// Coordinator settings from the `[lock]` section
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            quorum: self.lock.quorum,
            retry_count: self.lock.retry_count,
            retry_delay: Duration::from_millis(self.lock.retry_delay_ms),
            clock_drift_factor: self.lock.clock_drift_factor,
        }
    }

    /// Open every configured store and build a coordinator
    pub fn coordinator(&self) -> crate::Result<LockCoordinator> {
        let stores = self
            .stores
            .iter()
            .map(|s| open_store(&s.url, Duration::from_millis(s.timeout_ms)))
            .collect::<crate::Result<Vec<Arc<dyn LockStore>>>>()?;

        LockCoordinator::configure(stores, self.coordinator_config())
    }

    /// Keys accepted by [`Config::get`] and [`Config::set`]
    pub fn keys() -> &'static [&'static str] {
        CONFIG_KEYS
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "lock.quorum" => Ok(self
                .lock
                .quorum
                .map(|q| q.to_string())
                .unwrap_or_else(|| "(not set)".to_string())),
            "lock.retry_count" => Ok(self.lock.retry_count.to_string()),
            "lock.retry_delay_ms" => Ok(self.lock.retry_delay_ms.to_string()),
            "lock.clock_drift_factor" => Ok(self.lock.clock_drift_factor.to_string()),
            "lock.default_ttl_ms" => Ok(self.lock.default_ttl_ms.to_string()),

            "stores" => Ok(self
                .stores
                .iter()
                .map(|s| s.url.as_str())
                .collect::<Vec<_>>()
                .join(", ")),
            "stores.timeout_ms" => Ok(self
                .stores
                .iter()
                .map(|s| s.timeout_ms.to_string())
                .collect::<Vec<_>>()
                .join(", ")),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `redlock config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// The change is only kept if the resulting configuration is valid.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut updated = self.clone();
        updated.apply(key, value)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "lock.quorum" => {
                self.lock.quorum = if value.is_empty() || value == "none" {
                    None
                } else {
                    let quorum: usize = value
                        .parse()
                        .with_context(|| format!("Invalid quorum value: {}", value))?;
                    Some(quorum)
                };
            }
            "lock.retry_count" => {
                self.lock.retry_count = value
                    .parse()
                    .with_context(|| format!("Invalid retry_count value: {}", value))?;
            }
            "lock.retry_delay_ms" => {
                self.lock.retry_delay_ms = value
                    .parse()
                    .with_context(|| format!("Invalid retry_delay_ms value: {}", value))?;
            }
            "lock.clock_drift_factor" => {
                let factor: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid clock_drift_factor value: {}", value))?;
                if !(0.0..1.0).contains(&factor) {
                    return Err(anyhow!("Clock drift factor must be within [0, 1)"));
                }
                self.lock.clock_drift_factor = factor;
            }
            "lock.default_ttl_ms" => {
                self.lock.default_ttl_ms = value
                    .parse()
                    .with_context(|| format!("Invalid default_ttl_ms value: {}", value))?;
            }

            "stores" => {
                self.stores = value
                    .split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(StoreConfig::new)
                    .collect();
            }
            "stores.timeout_ms" => {
                let timeout: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid timeout_ms value: {}", value))?;
                for store in &mut self.stores {
                    store.timeout_ms = timeout;
                }
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `redlock config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }
}
