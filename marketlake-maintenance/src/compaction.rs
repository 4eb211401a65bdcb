//! Compaction (spec §4.I, §4.C, §9): merges many small Parquet files within
//! a partition into one, applying the duplicate-resolution policy declared
//! by the table's schema. A whole-partition replace — snapshot the file
//! list, write the merged replacement to a sibling staging directory, then
//! atomically swap it into place — so readers never observe a partial
//! merge, and any append that lands mid-merge is simply picked up by the
//! next compaction run rather than blocked on (spec §9 "Open question:
//! compaction and in-flight writes").

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use datafusion::arrow::array::{Array, Float64Array, Int32Array, Int64Array, StringArray, UInt32Array, UInt64Array};
use datafusion::arrow::compute::{concat_batches, take};
use datafusion::arrow::record_batch::RecordBatch;
use marketlake_lake::{sort_by_primary_key, swap_directories, LakeLayout, ParquetWriter};
use marketlake_schema::SchemaEntry;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rand::Rng;
use tracing::{info, warn};

/// One `year=YYYY` partition, or the whole table directory for a
/// non-partitioned table (`year` is `None` in that case).
#[derive(Debug, Clone)]
struct Partition {
    year: Option<u16>,
    files: Vec<PathBuf>,
}

/// Groups `entry`'s files by partition. Non-partitioned tables compact as a
/// single group spanning the whole table directory.
fn group_by_partition(entry: &SchemaEntry, files: Vec<PathBuf>) -> Vec<Partition> {
    if !entry.is_partitioned() {
        return vec![Partition { year: None, files }];
    }

    let mut groups: BTreeMap<u16, Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        let year = file.ancestors().find_map(|p| {
            p.file_name()?.to_str()?.strip_prefix("year=")?.parse::<u16>().ok()
        });
        match year {
            Some(year) => groups.entry(year).or_default().push(file),
            None => warn!(path = %file.display(), "file under a partitioned table is not inside a year=YYYY directory, skipping"),
        }
    }
    groups.into_iter().map(|(year, files)| Partition { year: Some(year), files }).collect()
}

/// Compacts every partition of `entry` whose file count is at or above
/// `threshold`. Returns the number of partitions actually merged.
pub async fn compact_table(
    layout: &LakeLayout,
    writer: &ParquetWriter,
    entry: &SchemaEntry,
    threshold: usize,
) -> Result<usize> {
    let files = layout.scan(&entry.name).with_context(|| format!("scanning {} for compaction", entry.name))?;
    let partitions = group_by_partition(entry, files);

    let mut merged = 0;
    for partition in partitions {
        if partition.files.len() < threshold.max(2) {
            continue;
        }
        compact_partition(layout, writer, entry, &partition).await?;
        merged += 1;
    }
    Ok(merged)
}

async fn compact_partition(
    layout: &LakeLayout,
    writer: &ParquetWriter,
    entry: &SchemaEntry,
    partition: &Partition,
) -> Result<()> {
    let combined = read_and_concat(&partition.files)
        .with_context(|| format!("reading partition files for {}", entry.name))?;
    let deduped = resolve_duplicates(entry, &combined)?;
    let sorted = sort_by_primary_key(&deduped, &entry.primary_key)?;

    let (canonical, staging, backup) = match partition.year {
        Some(year) => (
            layout.partition_for(&entry.name, year),
            layout.partition_staging_dir(&entry.name, year),
            layout.partition_backup_dir(&entry.name, year),
        ),
        None => (layout.path_for(&entry.name), layout.staging_dir(&entry.name), layout.backup_dir(&entry.name)),
    };

    if staging.exists() {
        tokio::fs::remove_dir_all(&staging).await.with_context(|| format!("clearing stale staging dir {}", staging.display()))?;
    }
    tokio::fs::create_dir_all(&staging).await.with_context(|| format!("creating staging dir {}", staging.display()))?;

    let staging_rel = staging
        .strip_prefix(layout.root())
        .with_context(|| "staging dir is not under the lake root")?;
    let rand_id: u64 = rand::thread_rng().gen();
    let file_rel = staging_rel.join(format!("part-{rand_id:016x}.parquet"));
    writer
        .write_single_file(&entry.name, &file_rel.to_string_lossy(), &sorted)
        .await
        .with_context(|| format!("writing compacted file for {}", entry.name))?;

    swap_directories(&entry.name, &staging, &canonical, &backup)
        .await
        .with_context(|| format!("swapping compacted partition into place for {}", entry.name))?;

    info!(
        table = %entry.name,
        year = ?partition.year,
        files_merged = partition.files.len(),
        rows = sorted.num_rows(),
        "compacted partition"
    );
    Ok(())
}

fn read_and_concat(files: &[PathBuf]) -> Result<RecordBatch> {
    let mut schema = None;
    let mut batches = Vec::new();
    for path in files {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("reading parquet metadata for {}", path.display()))?;
        let reader = builder.build().with_context(|| format!("building reader for {}", path.display()))?;
        for batch in reader {
            let batch = batch.with_context(|| format!("reading batch from {}", path.display()))?;
            schema.get_or_insert_with(|| batch.schema());
            batches.push(batch);
        }
    }
    let schema = schema.context("no rows found across the partition's files")?;
    concat_batches(&schema, &batches).context("concatenating partition files")
}

/// Applies spec §4.C's duplicate-resolution policy, then selects the
/// winning rows out of `batch` via `take`. Row order after this function is
/// unspecified — `compact_partition` re-sorts by primary key afterward.
fn resolve_duplicates(entry: &SchemaEntry, batch: &RecordBatch) -> Result<RecordBatch> {
    let winners: Vec<u32> = match (&entry.revision_col, &entry.reporting_period_col) {
        (Some(revision_col), Some(reporting_period_col)) => {
            resolve_by_revision(entry, batch, revision_col, reporting_period_col)?
        }
        _ => resolve_by_last_occurrence(&entry.primary_key, batch)?,
    };

    let indices = UInt32Array::from(winners);
    let columns = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None).map_err(Into::into))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(batch.schema(), columns).context("rebuilding deduplicated batch")
}

/// "Keep the last occurrence by primary key": iterate rows in arrival
/// order, overwriting the map entry for each key, so the surviving row
/// index for each key is always the last one seen.
fn resolve_by_last_occurrence(primary_key: &[String], batch: &RecordBatch) -> Result<Vec<u32>> {
    let key_columns = string_keys(batch, primary_key)?;
    let mut last_seen: HashMap<String, u32> = HashMap::new();
    for row in 0..batch.num_rows() {
        let key = composite_key(&key_columns, row);
        last_seen.insert(key, row as u32);
    }
    let mut winners: Vec<u32> = last_seen.into_values().collect();
    winners.sort_unstable();
    Ok(winners)
}

/// Within `(primary_key - date_col, reporting_period)` groups, keep the row
/// with the maximum revision value; ties broken by arrival order (later
/// wins), per spec §4.C and §9's schema-declared revision column.
fn resolve_by_revision(
    entry: &SchemaEntry,
    batch: &RecordBatch,
    revision_col: &str,
    reporting_period_col: &str,
) -> Result<Vec<u32>> {
    let mut group_cols: Vec<String> = entry
        .primary_key
        .iter()
        .filter(|c| entry.date_col.as_deref() != Some(c.as_str()))
        .cloned()
        .collect();
    group_cols.push(reporting_period_col.to_string());

    let key_columns = string_keys(batch, &group_cols)?;
    let revision_idx = batch
        .schema()
        .index_of(revision_col)
        .with_context(|| format!("revision column {revision_col} absent from batch"))?;
    let revisions = numeric_column(batch.column(revision_idx).as_ref())?;

    let mut best: HashMap<String, (u32, f64)> = HashMap::new();
    for row in 0..batch.num_rows() {
        let key = composite_key(&key_columns, row);
        let revision = revisions[row];
        match best.get(&key) {
            Some((_, current_best)) if revision < *current_best => {}
            _ => {
                best.insert(key, (row as u32, revision));
            }
        }
    }
    let mut winners: Vec<u32> = best.into_values().map(|(row, _)| row).collect();
    winners.sort_unstable();
    Ok(winners)
}

fn string_keys<'a>(batch: &'a RecordBatch, columns: &[String]) -> Result<Vec<&'a StringArray>> {
    columns
        .iter()
        .map(|col| {
            let idx = batch.schema().index_of(col).with_context(|| format!("key column {col} absent from batch"))?;
            batch
                .column(idx)
                .as_any()
                .downcast_ref::<StringArray>()
                .with_context(|| format!("key column {col} is not a UTF-8 column"))
        })
        .collect()
}

fn composite_key(columns: &[&StringArray], row: usize) -> String {
    columns
        .iter()
        .map(|c| if c.is_null(row) { "\u{0}".to_string() } else { c.value(row).to_string() })
        .collect::<Vec<_>>()
        .join("\u{1}")
}

/// Reads a revision column as `f64` regardless of its concrete numeric
/// arrow type, so schema authors can declare it as whatever integer or
/// float type their upstream actually returns.
fn numeric_column(array: &dyn Array) -> Result<Vec<f64>> {
    if let Some(a) = array.as_any().downcast_ref::<Float64Array>() {
        return Ok((0..a.len()).map(|i| if a.is_null(i) { f64::MIN } else { a.value(i) }).collect());
    }
    if let Some(a) = array.as_any().downcast_ref::<Int64Array>() {
        return Ok((0..a.len()).map(|i| if a.is_null(i) { f64::MIN } else { a.value(i) as f64 }).collect());
    }
    if let Some(a) = array.as_any().downcast_ref::<Int32Array>() {
        return Ok((0..a.len()).map(|i| if a.is_null(i) { f64::MIN } else { a.value(i) as f64 }).collect());
    }
    if let Some(a) = array.as_any().downcast_ref::<UInt64Array>() {
        return Ok((0..a.len()).map(|i| if a.is_null(i) { f64::MIN } else { a.value(i) as f64 }).collect());
    }
    if let Some(a) = array.as_any().downcast_ref::<StringArray>() {
        return Ok((0..a.len())
            .map(|i| if a.is_null(i) { f64::MIN } else { a.value(i).parse().unwrap_or(f64::MIN) })
            .collect());
    }
    anyhow::bail!("unsupported revision column type: {:?}", array.data_type())
}
