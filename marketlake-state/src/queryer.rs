//! `maxDate(table, entities?) -> map[entity -> YYYYMMDD]` (spec §4.D).
//!
//! Reads only the primary-key-plus-date columns (column-pruning projection)
//! from every file enumerated by [`LakeLayout::scan`] at call time — files
//! that land after enumeration are simply not part of this read, which is
//! the "as-of enumeration snapshot" consistency the spec asks for. `YYYYMMDD`
//! strings compare lexicographically in date order, so "max" is a plain
//! string max, no date parsing needed.

use std::collections::HashMap;
use std::fs::File;

use datafusion::arrow::array::{Array, StringArray};
use marketlake_core::error::StateError;
use marketlake_lake::LakeLayout;
use marketlake_schema::SchemaEntry;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReaderBuilder, ProjectionMask};

#[derive(Debug, Clone)]
pub struct StateQueryer {
    layout: LakeLayout,
}

impl StateQueryer {
    pub fn new(layout: LakeLayout) -> Self {
        Self { layout }
    }

    /// `maxDate(table, entities?)`.
    pub fn max_date(
        &self,
        entry: &SchemaEntry,
        entities: &[String],
    ) -> Result<HashMap<String, String>, StateError> {
        let Some(date_col) = entry.date_col.as_deref() else {
            return Ok(HashMap::new());
        };

        if entities.is_empty() {
            return self.global_max(entry, date_col);
        }

        let entity_col = entry.entity_column().ok_or_else(|| StateError::LakeUnreadable {
            table: entry.name.clone(),
            reason: "specific entities requested but table has no entity column".to_string(),
        })?;
        self.max_by_entity(entry, date_col, entity_col, entities)
    }

    fn global_max(&self, entry: &SchemaEntry, date_col: &str) -> Result<HashMap<String, String>, StateError> {
        let mut global: Option<String> = None;
        self.for_each_row(entry, &[date_col], |cols| {
            if let Some(date) = cols[0] {
                if global.as_deref().map(|g| date > g).unwrap_or(true) {
                    global = Some(date.to_string());
                }
            }
        })?;
        Ok(match global {
            Some(max) => HashMap::from([(String::new(), max)]),
            None => HashMap::new(),
        })
    }

    /// Distinct values of `entity_col` across every file for `entry`, used by
    /// the planner to resolve the current entity universe from the
    /// `instruments` table. Sorted for a deterministic plan.
    pub fn entities_in_table(&self, entry: &SchemaEntry, entity_col: &str) -> Result<Vec<String>, StateError> {
        let mut seen = std::collections::BTreeSet::new();
        self.for_each_row(entry, &[entity_col], |cols| {
            if let Some(value) = cols[0] {
                seen.insert(value.to_string());
            }
        })?;
        Ok(seen.into_iter().collect())
    }

    fn max_by_entity(
        &self,
        entry: &SchemaEntry,
        date_col: &str,
        entity_col: &str,
        entities: &[String],
    ) -> Result<HashMap<String, String>, StateError> {
        let wanted: std::collections::HashSet<&str> = entities.iter().map(String::as_str).collect();
        let mut per_entity: HashMap<String, String> = HashMap::new();

        self.for_each_row(entry, &[entity_col, date_col], |cols| {
            let (Some(entity), Some(date)) = (cols[0], cols[1]) else {
                return;
            };
            if !wanted.contains(entity) {
                return;
            }
            per_entity
                .entry(entity.to_string())
                .and_modify(|cur| {
                    if date > cur.as_str() {
                        *cur = date.to_string();
                    }
                })
                .or_insert_with(|| date.to_string());
        })?;

        Ok(per_entity)
    }

    /// Scans every file under `entry.name`, projecting only `columns`, and
    /// invokes `visit` once per row with the column values in the same
    /// order (`None` for SQL nulls).
    fn for_each_row(
        &self,
        entry: &SchemaEntry,
        columns: &[&str],
        mut visit: impl FnMut(&[Option<&str>]),
    ) -> Result<(), StateError> {
        let lake_unreadable = |reason: String| StateError::LakeUnreadable { table: entry.name.clone(), reason };

        let files = self
            .layout
            .scan(&entry.name)
            .map_err(|e| lake_unreadable(e.to_string()))?;

        for path in files {
            let file = File::open(&path).map_err(|e| lake_unreadable(format!("opening {}: {e}", path.display())))?;
            let builder = ParquetRecordBatchReaderBuilder::try_new(file)
                .map_err(|e| lake_unreadable(format!("reading parquet metadata for {}: {e}", path.display())))?;

            let schema = builder.schema().clone();
            let indices: Vec<usize> = columns
                .iter()
                .map(|col| {
                    schema
                        .index_of(col)
                        .map_err(|_| lake_unreadable(format!("column {col} absent from {}", path.display())))
                })
                .collect::<Result<_, _>>()?;
            let mask = ProjectionMask::roots(builder.parquet_schema(), indices.clone());

            let reader = builder
                .with_projection(mask)
                .build()
                .map_err(|e| lake_unreadable(format!("building reader for {}: {e}", path.display())))?;

            for batch in reader {
                let batch = batch.map_err(|e| lake_unreadable(format!("reading batch from {}: {e}", path.display())))?;
                let arrays: Vec<&StringArray> = columns
                    .iter()
                    .map(|col| {
                        batch
                            .column_by_name(col)
                            .and_then(|a| a.as_any().downcast_ref::<StringArray>())
                            .ok_or_else(|| lake_unreadable(format!("column {col} is not UTF-8 in {}", path.display())))
                    })
                    .collect::<Result<_, _>>()?;

                for row in 0..batch.num_rows() {
                    let values: Vec<Option<&str>> = arrays
                        .iter()
                        .map(|arr| if arr.is_null(row) { None } else { Some(arr.value(row)) })
                        .collect();
                    visit(&values);
                }
            }
        }
        Ok(())
    }
}
