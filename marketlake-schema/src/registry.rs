//! `load(name)` / `list()` (spec §4.A). Loaded once at startup from a static
//! TOML document and treated as immutable for the process's lifetime: no
//! side effects, no I/O after construction.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use marketlake_core::error::SchemaError;

use crate::entry::SchemaEntry;

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entries: HashMap<String, SchemaEntry>,
}

impl SchemaRegistry {
    /// Parses the declarative schema document. Table keys double as the
    /// entry's `name` when the entry itself leaves `name` blank.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut parsed: HashMap<String, SchemaEntry> =
            toml::from_str(raw).context("parsing schema registry document")?;
        for (table_name, entry) in parsed.iter_mut() {
            if entry.name.is_empty() {
                entry.name = table_name.clone();
            }
        }
        Ok(Self { entries: parsed })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema registry file {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("loading schema registry from {}", path.display()))
    }

    /// Returns the entry or fails with `SchemaNotFound`.
    pub fn get(&self, name: &str) -> Result<&SchemaEntry, SchemaError> {
        self.entries
            .get(name)
            .ok_or_else(|| SchemaError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}
