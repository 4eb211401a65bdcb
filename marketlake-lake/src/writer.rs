//! Parquet Writer (spec §4.C): `writeAppend` (new unique file per partition
//! value, pre-existing files untouched) and `writeReplace` (atomic
//! stage/rename/cleanup dance). Guarantees I2, I4, I5.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use datafusion::arrow::record_batch::RecordBatch;
use object_store::buffered::BufWriter;
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::async_writer::ObjectStoreAsyncWriter;
use crate::batch_ops::{missing_columns, sort_by_primary_key, split_by_partition};
use crate::layout::LakeLayout;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("batch for table {table} does not cover primary key column(s) {missing:?}")]
    SchemaMismatch { table: String, missing: Vec<String> },

    #[error("I/O failure writing table {table}: {reason}")]
    IoFailure { table: String, reason: String },
}

/// Raised only by `write_replace`'s pre-flight check; a stale backup
/// directory means a previous run crashed mid-swap and the lake is in an
/// indeterminate state the process should not silently paper over (spec §7
/// `Aborting`).
#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("stale backup directory exists for table {0}; a previous replace did not complete cleanly")]
    StaleBackup(String),

    #[error(transparent)]
    Write(#[from] WriteError),
}

pub struct ParquetWriter {
    layout: LakeLayout,
    store: Arc<LocalFileSystem>,
}

impl ParquetWriter {
    pub fn new(layout: LakeLayout) -> Result<Self> {
        std::fs::create_dir_all(layout.root())
            .with_context(|| format!("creating lake root {}", layout.root().display()))?;
        let store = Arc::new(
            LocalFileSystem::new_with_prefix(layout.root())
                .with_context(|| format!("rooting object store at {}", layout.root().display()))?,
        );
        Ok(Self { layout, store })
    }

    pub fn layout(&self) -> &LakeLayout {
        &self.layout
    }

    /// `writeAppend(table, batch, partitionCols, entityTag?)`.
    pub async fn write_append(
        &self,
        table: &str,
        primary_key: &[String],
        partition_cols: &[String],
        batch: &RecordBatch,
        entity_tag: Option<&str>,
    ) -> Result<Vec<PathBuf>, WriteError> {
        let missing = missing_columns(batch.schema().as_ref(), primary_key);
        if !missing.is_empty() {
            return Err(WriteError::SchemaMismatch { table: table.to_string(), missing });
        }

        let sorted = sort_by_primary_key(batch, primary_key).map_err(|e| io_fail(table, e))?;
        let groups = split_by_partition(&sorted, partition_cols).map_err(|e| io_fail(table, e))?;

        let mut written = Vec::with_capacity(groups.len());
        for (suffix, group) in groups {
            let dir_rel = join_rel(table, &suffix);
            let filename = unique_filename(entity_tag);
            let rel_path = format!("{dir_rel}/{filename}");
            self.write_parquet_file(&rel_path, &group)
                .await
                .map_err(|e| io_fail(table, e))?;
            written.push(self.layout.root().join(&rel_path));
            info!(table, rows = group.num_rows(), path = %rel_path, "wrote append file");
        }
        Ok(written)
    }

    /// `writeReplace(table, batch, partitionCols)`: write to a staging
    /// directory, rename the canonical directory to a backup, rename staging
    /// into place, then delete the backup. Any failure in the final rename
    /// restores the backup so readers never observe a torn state (I2).
    pub async fn write_replace(
        &self,
        table: &str,
        primary_key: &[String],
        partition_cols: &[String],
        batch: &RecordBatch,
    ) -> Result<(), ReplaceError> {
        let missing = missing_columns(batch.schema().as_ref(), primary_key);
        if !missing.is_empty() {
            return Err(WriteError::SchemaMismatch { table: table.to_string(), missing }.into());
        }

        let staging = self.layout.staging_dir(table);
        let backup = self.layout.backup_dir(table);
        let canonical = self.layout.path_for(table);

        if backup.exists() {
            return Err(ReplaceError::StaleBackup(table.to_string()));
        }

        if staging.exists() {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| io_fail(table, e.into()))?;
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| io_fail(table, e.into()))?;

        let sorted = sort_by_primary_key(batch, primary_key).map_err(|e| io_fail(table, e))?;
        let groups = split_by_partition(&sorted, partition_cols).map_err(|e| io_fail(table, e))?;

        let staging_name = format!("{table}__staging__");
        for (suffix, group) in groups {
            let dir_rel = join_rel(&staging_name, &suffix);
            let filename = unique_filename(None);
            let rel_path = format!("{dir_rel}/{filename}");
            self.write_parquet_file(&rel_path, &group)
                .await
                .map_err(|e| io_fail(table, e))?;
        }

        swap_directories(table, &staging, &canonical, &backup).await?;
        info!(table, rows = batch.num_rows(), "replaced table snapshot");
        Ok(())
    }

    /// Writes `batch` to `rel_path` (relative to the lake root) as a single
    /// Parquet file, with no sorting, partitioning or schema check. Used by
    /// the maintenance worker to land a compacted partition's merged file
    /// into a staging directory before the atomic swap.
    pub async fn write_single_file(&self, table: &str, rel_path: &str, batch: &RecordBatch) -> Result<(), WriteError> {
        self.write_parquet_file(rel_path, batch).await.map_err(|e| io_fail(table, e))
    }

    async fn write_parquet_file(&self, rel_path: &str, batch: &RecordBatch) -> Result<()> {
        let path = ObjectPath::from(rel_path);
        let buf_writer = BufWriter::new(self.store.clone(), path);
        let counter = Arc::new(AtomicU64::new(0));
        let async_writer = ObjectStoreAsyncWriter::new(buf_writer, counter);

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer =
            AsyncArrowWriter::try_new(async_writer, batch.schema(), Some(props)).context("creating parquet writer")?;
        writer.write(batch).await.context("writing record batch")?;
        writer.close().await.context("closing parquet writer")?;
        Ok(())
    }
}

/// Renames `staging` into `canonical`, backing up any pre-existing
/// `canonical` at `backup` first and deleting it once the final rename
/// succeeds. Restores `backup` back to `canonical` if the final rename
/// fails, so `canonical` is never left missing or torn (spec §3 I2). Shared
/// by `write_replace` (whole-table swap) and the maintenance worker's
/// compaction (single-partition swap) — same dance, different directory.
pub async fn swap_directories(table: &str, staging: &PathBuf, canonical: &PathBuf, backup: &PathBuf) -> Result<(), WriteError> {
    let had_previous = canonical.exists();
    if had_previous {
        tokio::fs::rename(canonical, backup).await.map_err(|e| io_fail(table, e.into()))?;
    }

    match tokio::fs::rename(staging, canonical).await {
        Ok(()) => {
            if had_previous {
                if let Err(e) = tokio::fs::remove_dir_all(backup).await {
                    warn!(table, error = %e, "failed to delete backup after successful swap");
                }
            }
            Ok(())
        }
        Err(e) => {
            if had_previous {
                if let Err(restore_err) = tokio::fs::rename(backup, canonical).await {
                    warn!(table, error = %restore_err, "failed to restore backup after failed swap rename");
                }
            }
            Err(io_fail(table, e.into()))
        }
    }
}

fn join_rel(table: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        table.to_string()
    } else {
        format!("{table}/{suffix}")
    }
}

fn io_fail(table: &str, err: anyhow::Error) -> WriteError {
    WriteError::IoFailure { table: table.to_string(), reason: err.to_string() }
}

/// `part-<rand>[-<entity>].parquet`. The random 64-bit identifier alone
/// guarantees I5 across concurrent writers; the entity tag is purely for
/// operator readability when browsing the lake.
fn unique_filename(entity_tag: Option<&str>) -> String {
    let rand_id: u64 = rand::thread_rng().gen();
    match entity_tag.map(sanitize_entity_tag) {
        Some(tag) if !tag.is_empty() => format!("part-{rand_id:016x}-{tag}.parquet"),
        _ => format!("part-{rand_id:016x}.parquet"),
    }
}

fn sanitize_entity_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
