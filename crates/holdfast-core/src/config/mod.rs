//! Configuration management with file persistence

use crate::domain::locking::LockConfig;
use crate::error::Error;
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;


/// Holdfast configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub lock: LockSettings,
    pub store: StoreSettings,
}

/// Lock protocol timings, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    pub heartbeat_interval_ms: u64,
    pub stale_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub claim_settle_ms: u64,
}

/// Where the shared file store lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Store directory; defaults to the platform data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        let defaults = LockConfig::default();
        Self {
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            stale_timeout_ms: defaults.stale_timeout.as_millis() as u64,
            watchdog_interval_ms: defaults.watchdog_interval.as_millis() as u64,
            claim_settle_ms: defaults.claim_settle.as_millis() as u64,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_ms: crate::storage::file::DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

const KEYS: [&str; 6] = [
    "lock.heartbeat_interval_ms",
    "lock.stale_timeout_ms",
    "lock.watchdog_interval_ms",
    "lock.claim_settle_ms",
    "store.dir",
    "store.poll_interval_ms",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("HOLDFAST_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("holdfast")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or use defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.lock_config()
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        if self.store.poll_interval_ms == 0 {
            return Err(Error::ConfigError(
                "store.poll_interval_ms must be greater than zero".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Lock protocol configuration described by these settings
    pub fn lock_config(&self) -> LockConfig {
        LockConfig::default()
            .with_heartbeat_interval(Duration::from_millis(self.lock.heartbeat_interval_ms))
            .with_stale_timeout(Duration::from_millis(self.lock.stale_timeout_ms))
            .with_watchdog_interval(Duration::from_millis(self.lock.watchdog_interval_ms))
            .with_claim_settle(Duration::from_millis(self.lock.claim_settle_ms))
    }

    /// Directory of the shared file store
    pub fn store_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.store.dir {
            return Ok(dir.clone());
        }
        match dirs::data_dir() {
            Some(data) => Ok(data.join("holdfast").join("store")),
            None => Ok(Self::config_dir()?.join("store")),
        }
    }

    /// Polling period of the shared file store
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "lock.heartbeat_interval_ms" => Ok(self.lock.heartbeat_interval_ms.to_string()),
            "lock.stale_timeout_ms" => Ok(self.lock.stale_timeout_ms.to_string()),
            "lock.watchdog_interval_ms" => Ok(self.lock.watchdog_interval_ms.to_string()),
            "lock.claim_settle_ms" => Ok(self.lock.claim_settle_ms.to_string()),

            "store.dir" => Ok(self.store_dir()?.display().to_string()),
            "store.poll_interval_ms" => Ok(self.store.poll_interval_ms.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `holdfast config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// The whole configuration is validated after the change; on error the
    /// previous value is kept.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut updated = self.clone();
        match key {
            "lock.heartbeat_interval_ms" => {
                updated.lock.heartbeat_interval_ms = parse_ms(key, value)?;
            }
            "lock.stale_timeout_ms" => {
                updated.lock.stale_timeout_ms = parse_ms(key, value)?;
            }
            "lock.watchdog_interval_ms" => {
                updated.lock.watchdog_interval_ms = parse_ms(key, value)?;
            }
            "lock.claim_settle_ms" => {
                updated.lock.claim_settle_ms = parse_ms(key, value)?;
            }

            "store.dir" => {
                let value = value.trim();
                updated.store.dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "store.poll_interval_ms" => {
                updated.store.poll_interval_ms = parse_ms(key, value)?;
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `holdfast config list` to see available keys.",
                    key
                ));
            }
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_ms(key: &str, value: &str) -> anyhow::Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}
