//! Maintenance Worker (spec §4.I, §4.J): runs compaction and view refresh on
//! its own schedule, independent of the fetch/write request path. Owns the
//! embedded analytical database's view catalog — no other component mutates
//! it (spec §3 "Ownership").

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use cron::Schedule;
use datafusion::execution::context::SessionContext;
use marketlake_core::persisted_state::{TableFingerprint, ViewRefreshCache};
use marketlake_lake::{LakeLayout, ParquetWriter};
use marketlake_schema::SchemaRegistry;
use moka::future::Cache;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::compaction::compact_table;
use crate::view_refresh::{refresh_view, table_fingerprint};

/// In-memory mirror of the view-refresh cache, backed by the JSON file under
/// `<root>/.state/view_cache.json` (spec §2: "a `moka`-backed in-memory
/// layer plus a JSON file"). Checking the in-memory cache avoids a
/// stat-everything rescan plus a file read on every tick; the JSON file is
/// only consulted on process startup and only written back after a cycle
/// actually changes something.
pub struct MaintenanceWorker {
    layout: LakeLayout,
    writer: Arc<ParquetWriter>,
    registry: Arc<SchemaRegistry>,
    ctx: SessionContext,
    compaction_threshold: usize,
    view_cache: Cache<String, TableFingerprint>,
}

impl MaintenanceWorker {
    pub async fn new(
        layout: LakeLayout,
        writer: Arc<ParquetWriter>,
        registry: Arc<SchemaRegistry>,
        compaction_threshold: usize,
    ) -> Self {
        let view_cache = Cache::new(10_000);
        if let Ok(persisted) = ViewRefreshCache::load(layout.root()) {
            for (table, fingerprint) in persisted.by_table {
                view_cache.insert(table, fingerprint).await;
            }
        }
        Self { layout, writer, registry, ctx: SessionContext::new(), compaction_threshold, view_cache }
    }

    /// The embedded analytical database session. Shared with readers; only
    /// this worker calls `register_table`/`deregister_table` on it.
    pub fn session_context(&self) -> &SessionContext {
        &self.ctx
    }

    /// One maintenance pass: compact every table's partitions past the
    /// configured file-count threshold, then refresh every table's view
    /// (skipping tables whose directory fingerprint hasn't changed).
    /// Returns `true` if any view was actually refreshed, so the caller
    /// knows whether the on-disk cache is worth persisting.
    pub async fn run_cycle(&self) -> bool {
        let tables: Vec<String> = self.registry.list().into_iter().map(str::to_string).collect();

        for table in &tables {
            let entry = match self.registry.get(table) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            match compact_table(&self.layout, &self.writer, entry, self.compaction_threshold).await {
                Ok(0) => {}
                Ok(n) => info!(table, partitions_merged = n, "compaction pass completed"),
                Err(err) => error!(table, error = %err, "compaction pass failed"),
            }
        }

        let mut refreshed_any = false;
        for table in &tables {
            match self.refresh_one(table).await {
                Ok(refreshed) => refreshed_any |= refreshed,
                Err(err) => error!(table, error = %err, "view refresh failed"),
            }
        }
        refreshed_any
    }

    async fn refresh_one(&self, table: &str) -> Result<bool> {
        let entry = self.registry.get(table).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let fingerprint = table_fingerprint(&self.layout, table)?;
        if self.view_cache.get(table).await == Some(fingerprint) {
            return Ok(false);
        }
        refresh_view(&self.ctx, &self.layout, entry).await?;
        self.view_cache.insert(table.to_string(), fingerprint).await;
        Ok(true)
    }

    fn persist_cache(&self) -> Result<()> {
        let mut cache = ViewRefreshCache::default();
        for (table, fingerprint) in self.view_cache.iter() {
            cache.update(&table, fingerprint);
        }
        cache.save(self.layout.root())
    }

    /// Runs `run_cycle` once immediately, persisting the cache afterward —
    /// used for the orchestrator's "one final view refresh" at run end
    /// (spec §4.K step 5) and can also be called standalone.
    pub async fn run_once(&self) -> Result<()> {
        self.run_cycle().await;
        self.persist_cache()
    }

    /// Runs forever on the cron schedule in `cron_expr` until `cancel`
    /// fires. Independent of the request path (spec §4.J): this is a
    /// separate loop the orchestrator spawns alongside the fetch/write
    /// pools, not triggered by them.
    pub async fn run_scheduled(&self, cron_expr: &str, cancel: CancellationToken) {
        let schedule = match Schedule::from_str(cron_expr) {
            Ok(schedule) => schedule,
            Err(err) => {
                error!(cron_expr, error = %err, "invalid maintenance schedule, maintenance worker will not run");
                return;
            }
        };

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(cron_expr, "schedule produced no upcoming run, stopping maintenance worker");
                return;
            };
            let delay = (next - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("maintenance worker cancelled while waiting for next scheduled run");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.run_cycle().await {
                if let Err(err) = self.persist_cache() {
                    warn!(error = %err, "failed to persist view refresh cache");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::StringArray;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::arrow::record_batch::RecordBatch;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_toml_str(
            r#"
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
    async fn run_once_refreshes_views_and_persists_cache() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        let writer = Arc::new(ParquetWriter::new(layout.clone()).unwrap());

        let schema = Arc::new(Schema::new(vec![Field::new("symbol", DataType::Utf8, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["A"]))]).unwrap();
        writer.write_replace("instruments", &["symbol".to_string()], &[], &batch).await.unwrap();

        let worker = MaintenanceWorker::new(layout.clone(), writer, Arc::new(registry()), 32).await;
        worker.run_once().await.unwrap();

        let df = worker.session_context().sql("SELECT * FROM instruments").await.unwrap();
        let rows = df.collect().await.unwrap();
        assert_eq!(rows.iter().map(|b| b.num_rows()).sum::<usize>(), 1);

        let cache = ViewRefreshCache::load(dir.path()).unwrap();
        assert!(cache.by_table.contains_key("instruments"));
    }

    #[tokio::test]
    async fn second_run_once_skips_unchanged_tables() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        let writer = Arc::new(ParquetWriter::new(layout.clone()).unwrap());

        let schema = Arc::new(Schema::new(vec![Field::new("symbol", DataType::Utf8, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["A"]))]).unwrap();
        writer.write_replace("instruments", &["symbol".to_string()], &[], &batch).await.unwrap();

        let worker = MaintenanceWorker::new(layout.clone(), writer, Arc::new(registry()), 32).await;
        assert!(worker.run_cycle().await);
        assert!(!worker.run_cycle().await);
    }

    #[tokio::test]
    async fn new_worker_warms_its_cache_from_the_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        let writer = Arc::new(ParquetWriter::new(layout.clone()).unwrap());

        let schema = Arc::new(Schema::new(vec![Field::new("symbol", DataType::Utf8, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["A"]))]).unwrap();
        writer.write_replace("instruments", &["symbol".to_string()], &[], &batch).await.unwrap();

        let first = MaintenanceWorker::new(layout.clone(), writer.clone(), Arc::new(registry()), 32).await;
        first.run_once().await.unwrap();

        let second = MaintenanceWorker::new(layout.clone(), writer, Arc::new(registry()), 32).await;
        assert!(!second.run_cycle().await);
    }
}
