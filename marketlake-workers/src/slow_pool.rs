//! Slow Worker Pool (spec §4.I): dispatches fetched batches to the Parquet
//! Writer, deriving the `year` partition column when the table is
//! partitioned and routing to `writeReplace` or `writeAppend` per the
//! table's update strategy.

use std::sync::Arc;

use marketlake_core::config::UpdateStrategy;
use marketlake_core::error::AbortError;
use marketlake_core::job::WriteJob;
use marketlake_lake::{derive_year_column, ParquetWriter, ReplaceError};
use marketlake_schema::SchemaRegistry;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct SlowWorkerPool {
    registry: Arc<SchemaRegistry>,
    writer: Arc<ParquetWriter>,
    worker_count: usize,
}

impl SlowWorkerPool {
    pub fn new(registry: Arc<SchemaRegistry>, writer: Arc<ParquetWriter>, worker_count: usize) -> Self {
        Self { registry, writer, worker_count: worker_count.max(1) }
    }

    /// Drains `write_rx` to completion. Mirrors the fast pool's shutdown
    /// shape: workers stop pulling new jobs once `cancel` fires but do not
    /// abort a write already in flight (a partial Parquet file is worse
    /// than a slightly late shutdown).
    pub async fn run(&self, write_rx: mpsc::Receiver<WriteJob>, cancel: CancellationToken) {
        let write_rx = Arc::new(Mutex::new(write_rx));
        let mut handles = Vec::with_capacity(self.worker_count);

        for _ in 0..self.worker_count {
            let write_rx = write_rx.clone();
            let registry = self.registry.clone();
            let writer = self.writer.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = write_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            maybe = rx.recv() => maybe,
                        }
                    };
                    let Some(job) = job else { break };
                    if let Err(abort) = handle_write(&registry, &writer, job).await {
                        error!(error = %abort, "aborting run: unrecoverable invariant violation");
                        cancel.cancel();
                        break;
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Writes one batch. Returns `Err(AbortError)` only for the unrecoverable
/// case a per-job retry can't fix — a stale `__backup__` directory left by a
/// previous run that crashed mid-swap (spec §7 `Aborting`, `ReplaceError::
/// StaleBackup`'s doc comment). Every other failure (unknown table, bad
/// batch, ordinary I/O error) is logged and the job is dropped; the run
/// continues per spec §7 "the specific job fails; run continues".
async fn handle_write(registry: &SchemaRegistry, writer: &ParquetWriter, job: WriteJob) -> Result<(), AbortError> {
    let entry = match registry.get(&job.table) {
        Ok(entry) => entry,
        Err(err) => {
            warn!(table = %job.table, error = %err, "unknown table, dropping write job");
            return Ok(());
        }
    };

    let (batch, partition_cols) = match entry.date_col.as_deref() {
        Some(date_col) => match derive_year_column(&job.batch, date_col) {
            Ok(batch) => (batch, vec!["year".to_string()]),
            Err(err) => {
                warn!(table = %job.table, entity = %job.entity, error = %err, "failed to derive year column, dropping write job");
                return Ok(());
            }
        },
        None => (job.batch.clone(), Vec::new()),
    };

    let rows = batch.num_rows();
    match entry.update_strategy {
        UpdateStrategy::FullReplace => {
            match writer.write_replace(&entry.name, &entry.primary_key, &partition_cols, &batch).await {
                Ok(()) => info!(table = %job.table, entity = %job.entity, rows, "wrote batch"),
                Err(ReplaceError::StaleBackup(table)) => {
                    return Err(AbortError::InvariantViolation(format!(
                        "stale backup directory for table {table}; a previous replace did not complete cleanly"
                    )));
                }
                Err(ReplaceError::Write(err)) => {
                    warn!(table = %job.table, entity = %job.entity, error = %err, "write failed");
                }
            }
        }
        UpdateStrategy::Incremental => {
            let entity_tag = if job.entity.is_empty() { None } else { Some(job.entity.as_str()) };
            match writer.write_append(&entry.name, &entry.primary_key, &partition_cols, &batch, entity_tag).await {
                Ok(_files) => info!(table = %job.table, entity = %job.entity, rows, "wrote batch"),
                Err(err) => warn!(table = %job.table, entity = %job.entity, error = %err, "write failed"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::arrow::record_batch::RecordBatch;
    use marketlake_lake::LakeLayout;

    fn daily_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("symbol", DataType::Utf8, false),
            Field::new("trade_date", DataType::Utf8, false),
            Field::new("close", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["A", "A"])),
                Arc::new(StringArray::from(vec!["19901219", "19901220"])),
                Arc::new(Int64Array::from(vec![10, 11])),
            ],
        )
        .unwrap()
    }

    fn instruments_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("symbol", DataType::Utf8, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["A", "B"]))]).unwrap()
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_toml_str(
            r#"
[daily]
primary_key = ["symbol", "trade_date"]
date_col = "trade_date"
update_strategy = "incremental"
update_by_symbol = true
upstream_api_id = "daily"

[instruments]
primary_key = ["symbol"]
update_strategy = "full_replace"
update_by_symbol = false
upstream_api_id = "stock_basic"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn incremental_write_partitions_by_derived_year() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ParquetWriter::new(LakeLayout::new(dir.path())).unwrap());
        let registry = Arc::new(registry());

        let job = WriteJob { table: "daily".to_string(), entity: "A".to_string(), batch: daily_batch() };
        handle_write(&registry, &writer, job).await.unwrap();

        let layout = LakeLayout::new(dir.path());
        let files = layout.scan("daily").unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().contains("year=1990"));
    }

    #[tokio::test]
    async fn full_replace_write_has_no_partitioning() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ParquetWriter::new(LakeLayout::new(dir.path())).unwrap());
        let registry = Arc::new(registry());

        let job = WriteJob { table: "instruments".to_string(), entity: String::new(), batch: instruments_batch() };
        handle_write(&registry, &writer, job).await.unwrap();

        let layout = LakeLayout::new(dir.path());
        assert_eq!(layout.scan("instruments").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_table_is_dropped_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ParquetWriter::new(LakeLayout::new(dir.path())).unwrap());
        let registry = Arc::new(registry());

        let job = WriteJob { table: "not_a_table".to_string(), entity: String::new(), batch: instruments_batch() };
        handle_write(&registry, &writer, job).await.unwrap();

        let layout = LakeLayout::new(dir.path());
        assert!(layout.scan("not_a_table").is_err() || layout.scan("not_a_table").unwrap().is_empty());
    }

    #[tokio::test]
    async fn pool_run_drains_the_write_queue_and_stops_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ParquetWriter::new(LakeLayout::new(dir.path())).unwrap());
        let registry = Arc::new(registry());
        let pool = SlowWorkerPool::new(registry, writer, 2);

        let (tx, rx) = mpsc::channel(4);
        tx.send(WriteJob { table: "daily".to_string(), entity: "A".to_string(), batch: daily_batch() })
            .await
            .unwrap();
        drop(tx);

        pool.run(rx, CancellationToken::new()).await;

        let layout = LakeLayout::new(dir.path());
        assert_eq!(layout.scan("daily").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_backup_directory_aborts_rather_than_failing_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        std::fs::create_dir_all(layout.backup_dir("instruments")).unwrap();
        let writer = Arc::new(ParquetWriter::new(layout).unwrap());
        let registry = Arc::new(registry());

        let job = WriteJob { table: "instruments".to_string(), entity: String::new(), batch: instruments_batch() };
        let err = handle_write(&registry, &writer, job).await.unwrap_err();
        assert!(matches!(err, AbortError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn stale_backup_directory_cancels_the_pool_without_draining_further_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        std::fs::create_dir_all(layout.backup_dir("instruments")).unwrap();
        let writer = Arc::new(ParquetWriter::new(layout).unwrap());
        let registry = Arc::new(registry());
        let pool = SlowWorkerPool::new(registry, writer, 1);

        let (tx, rx) = mpsc::channel(4);
        tx.send(WriteJob { table: "instruments".to_string(), entity: String::new(), batch: instruments_batch() })
            .await
            .unwrap();
        drop(tx);

        let cancel = CancellationToken::new();
        pool.run(rx, cancel.clone()).await;
        assert!(cancel.is_cancelled(), "a stale backup must trigger graceful shutdown (spec §7 Aborting)");
    }
}
