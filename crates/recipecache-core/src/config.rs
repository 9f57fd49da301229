//! Repository configuration management.
//!
//! Holds the cache timeout, retry budget, default sync strategy and
//! optimism/logging toggles. Configuration can be built in code or loaded
//! from `~/.config/recipecache/config.json`; missing fields take defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for the config directory path
const APP_NAME: &str = "recipecache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Cached entries are valid for 5 minutes
const DEFAULT_CACHE_TIMEOUT_MS: u64 = 300_000;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base backoff unit; attempt n waits `retry_delay * 2^(n-1)`
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// When a registered write is handed to the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Sync inline; the caller sees the final outcome
    Immediate,
    /// Sync after one base retry delay
    #[default]
    Delayed,
    /// Queue until `sync_all`
    Batch,
    /// Queue until `sync_all`
    Manual,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::Immediate => write!(f, "immediate"),
            SyncStrategy::Delayed => write!(f, "delayed"),
            SyncStrategy::Batch => write!(f, "batch"),
            SyncStrategy::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for SyncStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(SyncStrategy::Immediate),
            "delayed" => Ok(SyncStrategy::Delayed),
            "batch" => Ok(SyncStrategy::Batch),
            "manual" => Ok(SyncStrategy::Manual),
            other => Err(anyhow::anyhow!("Unknown sync strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Entry validity window in milliseconds
    #[serde(rename = "cacheTimeout")]
    pub cache_timeout_ms: u64,
    /// Attempts per operation before it is abandoned
    pub max_retries: u32,
    /// Base backoff unit in milliseconds
    #[serde(rename = "retryDelay")]
    pub retry_delay_ms: u64,
    /// Default for writes that don't specify one
    pub sync_strategy: SyncStrategy,
    /// Mutate the cache before the remote store confirms
    pub optimistic_updates: bool,
    /// Emit repository diagnostics through `tracing`
    pub enable_logging: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            cache_timeout_ms: DEFAULT_CACHE_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            sync_strategy: SyncStrategy::default(),
            optimistic_updates: true,
            enable_logging: true,
        }
    }
}

impl RepositoryConfig {
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.sync_strategy = strategy;
        self
    }

    pub fn with_optimistic_updates(mut self, enabled: bool) -> Self {
        self.optimistic_updates = enabled;
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}
