//! The two small JSON files under `<root>/.state/` (spec §6 "Persisted
//! state"): per-group `lastRunTimestamp` and the per-table view-refresh
//! cache. Both are single-writer (the orchestrator and the maintenance
//! worker respectively) and are read-modify-written as a whole file — there
//! is no concurrent-writer story to support, so no file locking is needed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const RUNS_FILE: &str = "runs.json";
const VIEW_CACHE_FILE: &str = "view_cache.json";

pub fn state_dir(lake_root: &Path) -> PathBuf {
    lake_root.join(".state")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastRuns {
    #[serde(flatten)]
    pub by_group: HashMap<String, DateTime<Utc>>,
}

impl LastRuns {
    pub fn load(lake_root: &Path) -> Result<Self> {
        load_json(&state_dir(lake_root).join(RUNS_FILE))
    }

    pub fn save(&self, lake_root: &Path) -> Result<()> {
        save_json(&state_dir(lake_root).join(RUNS_FILE), self)
    }

    pub fn record(&mut self, group: &str, at: DateTime<Utc>) {
        self.by_group.insert(group.to_string(), at);
    }
}

/// Tracks `(fileCount, latestMtime)` per table so the maintenance worker can
/// skip a view refresh when nothing changed (spec §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFingerprint {
    pub file_count: usize,
    pub latest_mtime_unix: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewRefreshCache {
    #[serde(flatten)]
    pub by_table: HashMap<String, TableFingerprint>,
}

impl ViewRefreshCache {
    pub fn load(lake_root: &Path) -> Result<Self> {
        load_json(&state_dir(lake_root).join(VIEW_CACHE_FILE))
    }

    pub fn save(&self, lake_root: &Path) -> Result<()> {
        save_json(&state_dir(lake_root).join(VIEW_CACHE_FILE), self)
    }

    pub fn is_unchanged(&self, table: &str, current: TableFingerprint) -> bool {
        self.by_table.get(table) == Some(&current)
    }

    pub fn update(&mut self, table: &str, current: TableFingerprint) {
        self.by_table.insert(table.to_string(), current);
    }
}

fn load_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing state file {}", path.display()))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_runs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut runs = LastRuns::default();
        let now = Utc::now();
        runs.record("daily_group", now);
        runs.save(dir.path()).unwrap();

        let reloaded = LastRuns::load(dir.path()).unwrap();
        assert_eq!(reloaded.by_group.get("daily_group").unwrap(), &now);
    }

    #[test]
    fn view_cache_detects_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ViewRefreshCache::default();
        let fp = TableFingerprint {
            file_count: 3,
            latest_mtime_unix: 1000,
        };
        assert!(!cache.is_unchanged("daily", fp));
        cache.update("daily", fp);
        assert!(cache.is_unchanged("daily", fp));
        cache.save(dir.path()).unwrap();

        let reloaded = ViewRefreshCache::load(dir.path()).unwrap();
        assert!(reloaded.is_unchanged("daily", fp));
    }
}
