//! The registry entry for a single table (spec §3 "Table schema (registry
//! entry)").

use std::collections::HashMap;

use marketlake_core::config::UpdateStrategy;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaEntry {
    /// Logical and on-disk identifier. Defaults to the TOML table key if
    /// omitted, same convention as the original Python loader.
    #[serde(default)]
    pub name: String,

    /// Ordered list of columns uniquely identifying a row.
    pub primary_key: Vec<String>,

    /// Column whose values are `YYYYMMDD` date strings. Its presence
    /// declares the table partitionable by year (spec §3 invariant I3).
    #[serde(default)]
    pub date_col: Option<String>,

    pub update_strategy: UpdateStrategy,

    /// Whether incremental bookkeeping is per-entity (`true`) or global.
    #[serde(default)]
    pub update_by_symbol: bool,

    /// Opaque routing info consumed by the Fetcher (spec §4.F).
    pub upstream_api_id: String,

    #[serde(default)]
    pub required_params: HashMap<String, String>,

    /// Schema-declared revision column used to resolve duplicates within a
    /// `(primary_key - date_col, reporting_period)` group during compaction
    /// (spec §4.C, §9 open question). `None` for tables whose duplicate
    /// resolution is plain "last occurrence wins".
    #[serde(default)]
    pub revision_col: Option<String>,

    /// Column grouping revisions of the same logical fact (e.g. a fiscal
    /// reporting period), required when `revision_col` is set.
    #[serde(default)]
    pub reporting_period_col: Option<String>,

    /// Column identifying the entity (symbol) a row belongs to, consulted by
    /// the State Queryer when grouping by entity (spec §4.D). Defaults to
    /// the first primary-key column when `update_by_symbol` is set, since
    /// every such table in practice keys its rows by entity first.
    #[serde(default)]
    pub entity_col: Option<String>,
}

impl SchemaEntry {
    pub fn is_partitioned(&self) -> bool {
        self.date_col.is_some()
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self.update_strategy, UpdateStrategy::Incremental)
    }

    pub fn entity_column(&self) -> Option<&str> {
        if let Some(col) = self.entity_col.as_deref() {
            return Some(col);
        }
        if self.update_by_symbol {
            return self.primary_key.first().map(String::as_str);
        }
        None
    }
}
