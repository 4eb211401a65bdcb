//! The consumed configuration shape (spec §6). The loader is deliberately
//! thin — parsing and shape validation only, no CLI surface. Source document
//! is TOML; `serde` does the heavy lifting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub workers: WorkersConfig,
    #[serde(default)]
    pub retry: HashMap<String, RetryConfig>,
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub tables: HashMap<String, TableConfig>,
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub calls_per_minute: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WorkersConfig {
    pub fast: usize,
    pub slow: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            factor: 2.0,
        }
    }
}

/// Mirrors the schema registry's `update_strategy` so the consumed config
/// shape matches spec §6 literally; the registry entry (`marketlake-schema`)
/// remains the canonical source consulted by the planner and slow pool.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    Incremental,
    FullReplace,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub update_strategy: UpdateStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    pub start_date: String,

    /// Universal upper bound (spec §4.G "configured universal end date"). A
    /// computed `start_date` past this is dropped silently.
    pub end_date: String,

    /// Hour of day (local, 0-23) after which "today" is considered a closed
    /// trading session worth fetching when `maxDate` has already caught up
    /// to it (spec §4.G time-of-day tie-break).
    pub market_close_hour: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    pub view_refresh_cron: String,
    pub compaction_threshold: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            view_refresh_cron: "0 * * * * *".to_string(),
            compaction_threshold: 32,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn retry_for(&self, table: &str) -> RetryConfig {
        self.retry.get(table).copied().unwrap_or_default()
    }

    pub fn rate_limit_for(&self, table: &str) -> u32 {
        self.rate_limits
            .get(table)
            .map(|c| c.calls_per_minute)
            .unwrap_or(60)
    }
}
