//! View refresh (spec §4.I): (re)creates a SQL view per table directory in
//! the embedded analytical database (`datafusion::SessionContext`), defined
//! as a Parquet read over that table's current file glob. Skipped when the
//! table directory's `(fileCount, latestMtime)` fingerprint is unchanged
//! since the last refresh (spec §4.I, §6 "Persisted state").

use std::sync::Arc;

use anyhow::{Context, Result};
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl};
use datafusion::execution::context::SessionContext;
use marketlake_core::persisted_state::TableFingerprint;
use marketlake_lake::LakeLayout;
use marketlake_schema::SchemaEntry;
use tracing::info;

/// `(fileCount, latestMtime)` for `table`'s current files, used to decide
/// whether a refresh is necessary.
pub fn table_fingerprint(layout: &LakeLayout, table: &str) -> Result<TableFingerprint> {
    let files = layout.scan(table).with_context(|| format!("scanning {table} for fingerprinting"))?;
    let mut latest_mtime_unix = 0i64;
    for file in &files {
        let meta = std::fs::metadata(file).with_context(|| format!("stat-ing {}", file.display()))?;
        let modified = meta.modified().with_context(|| format!("reading mtime of {}", file.display()))?;
        let unix = modified
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        latest_mtime_unix = latest_mtime_unix.max(unix);
    }
    Ok(TableFingerprint { file_count: files.len(), latest_mtime_unix })
}

/// (Re)registers `entry.name` as a view over every Parquet file currently
/// under its table directory. A no-op (view left unregistered) when the
/// table has no files yet.
pub async fn refresh_view(ctx: &SessionContext, layout: &LakeLayout, entry: &SchemaEntry) -> Result<()> {
    let table_dir = layout.path_for(&entry.name);
    if !table_dir.exists() {
        return Ok(());
    }

    let glob = if entry.is_partitioned() {
        format!("{}/**/*.parquet", table_dir.display())
    } else {
        format!("{}/*.parquet", table_dir.display())
    };

    let table_url = ListingTableUrl::parse(&glob)
        .with_context(|| format!("parsing listing glob for table {}", entry.name))?;
    let listing_options = ListingOptions::new(Arc::new(ParquetFormat::default())).with_file_extension(".parquet");
    let resolved_schema = listing_options
        .infer_schema(&ctx.state(), &table_url)
        .await
        .with_context(|| format!("inferring schema for table {}", entry.name))?;
    let config = ListingTableConfig::new(table_url)
        .with_listing_options(listing_options)
        .with_schema(resolved_schema);
    let provider = Arc::new(ListingTable::try_new(config).with_context(|| format!("building listing table for {}", entry.name))?);

    ctx.deregister_table(&entry.name).with_context(|| format!("deregistering stale view for {}", entry.name))?;
    ctx.register_table(&entry.name, provider).with_context(|| format!("registering view for {}", entry.name))?;
    info!(table = %entry.name, glob, "refreshed view");
    Ok(())
}
