//! Data Lake Layout (spec §4.B): pure path arithmetic over
//! `<root>/<table>/year=YYYY/*.parquet` (partitioned) or `<root>/<table>/*.parquet`
//! (non-partitioned). No caching — callers that want caching maintain their
//! own, per the contract.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// OS metadata files enumeration must ignore. A named whitelist, not a
/// catch-all dotfile filter, per spec §4.B.
const IGNORED_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", ".gitkeep"];

#[derive(Debug, Clone)]
pub struct LakeLayout {
    root: PathBuf,
}

impl LakeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `pathFor(table)`.
    pub fn path_for(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    /// `partitionFor(table, year)`.
    pub fn partition_for(&self, table: &str, year: u16) -> PathBuf {
        self.path_for(table).join(format!("year={year}"))
    }

    pub fn staging_dir(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}__staging__"))
    }

    pub fn backup_dir(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}__backup__"))
    }

    /// Staging/backup siblings of a single year partition, used by the
    /// maintenance worker's compaction so a partition merge can use the same
    /// stage/rename/delete-old dance as a full-table replace without
    /// touching any other partition (spec §9 "Compaction and in-flight
    /// writes").
    pub fn partition_staging_dir(&self, table: &str, year: u16) -> PathBuf {
        self.path_for(table).join(format!("year={year}__staging__"))
    }

    pub fn partition_backup_dir(&self, table: &str, year: u16) -> PathBuf {
        self.path_for(table).join(format!("year={year}__backup__"))
    }

    /// `scan(table)`: every Parquet file under the table's directory,
    /// recursively, ignoring the whitelisted OS metadata names. Missing
    /// directories scan as empty (an empty lake is not a failure, spec §4.D).
    pub fn scan(&self, table: &str) -> Result<Vec<PathBuf>> {
        let dir = self.path_for(table);
        let mut files = Vec::new();
        if dir.exists() {
            walk(&dir, &mut files).with_context(|| format!("scanning table directory {}", dir.display()))?;
        }
        files.sort();
        Ok(files)
    }
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if IGNORED_NAMES.contains(&name.as_ref()) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            out.push(path);
        }
    }
    Ok(())
}
