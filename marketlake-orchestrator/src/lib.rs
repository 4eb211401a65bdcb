//! Orchestrator (spec §4.K): owns the planner, the two queues, the two
//! worker pools and the maintenance worker for one `run(group,
//! overrideEntities?)` invocation.

use std::sync::Arc;
use std::time::Duration;

use marketlake_core::config::Config;
use marketlake_core::error::{AbortError, ExitCode};
use marketlake_core::job::WriteJob;
use marketlake_core::outcome::RunSummary;
use marketlake_core::persisted_state::LastRuns;
use marketlake_fetch::Fetcher;
use marketlake_lake::{LakeLayout, ParquetWriter};
use marketlake_maintenance::MaintenanceWorker;
use marketlake_planner::{PlanError, TaskPlanner};
use marketlake_ratelimit::RateLimitRegistry;
use marketlake_schema::SchemaRegistry;
use marketlake_state::StateQueryer;
use marketlake_workers::{FastWorkerPool, SlowWorkerPool};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long a clean run is given to drain the write queue and run the final
/// view refresh after a cancellation signal before the orchestrator gives up
/// and reports `ExitCode::ShutdownTimeout` (spec §6).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<SchemaRegistry>,
    fetcher: Arc<dyn Fetcher>,
    rate_limits: Arc<RateLimitRegistry>,
    writer: Arc<ParquetWriter>,
    state: StateQueryer,
    maintenance: Arc<MaintenanceWorker>,
}

impl Orchestrator {
    pub async fn new(
        config: Arc<Config>,
        registry: Arc<SchemaRegistry>,
        fetcher: Arc<dyn Fetcher>,
    ) -> anyhow::Result<Self> {
        let layout = LakeLayout::new(config.storage.root.clone());
        let writer = Arc::new(ParquetWriter::new(layout.clone())?);
        let state = StateQueryer::new(layout.clone());
        let rate_limits = Arc::new(RateLimitRegistry::new());
        let maintenance = Arc::new(
            MaintenanceWorker::new(layout, writer.clone(), registry.clone(), config.maintenance.compaction_threshold)
                .await,
        );
        Ok(Self { config, registry, fetcher, rate_limits, writer, state, maintenance })
    }

    /// Runs one named task group end to end (spec §4.K steps 1-6). Returns
    /// the exit code to report to the shell (spec §6).
    pub async fn run(&self, group: &str, override_entities: Option<&[String]>) -> ExitCode {
        let planner = TaskPlanner::new(&self.config, &self.registry, &self.state);
        let jobs = match planner.plan(group, override_entities) {
            Ok(jobs) => jobs,
            Err(err @ PlanError::UnknownGroup(_)) | Err(err @ PlanError::Aborted(_)) => {
                error!(group, error = %err, "planning aborted, no jobs will run");
                return ExitCode::PlanningAborted;
            }
        };
        info!(group, job_count = jobs.len(), "planned jobs");

        let cancel = CancellationToken::new();
        let shutdown_signal = cancel.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(error = %AbortError::Cancelled, "received shutdown signal, draining in-flight work");
                shutdown_signal.cancel();
            }
        });

        let maintenance_cancel = cancel.clone();
        let maintenance = self.maintenance.clone();
        let cron_expr = self.config.maintenance.view_refresh_cron.clone();
        let maintenance_handle =
            tokio::spawn(async move { maintenance.run_scheduled(&cron_expr, maintenance_cancel).await });

        let summary = Arc::new(Mutex::new(RunSummary::new(override_entities.is_some())));
        let (write_tx, write_rx) = tokio::sync::mpsc::channel::<WriteJob>(self.config.workers.slow.max(1) * 4);

        let fast_pool = FastWorkerPool::new(
            self.registry.clone(),
            self.fetcher.clone(),
            self.rate_limits.clone(),
            self.config.clone(),
        );
        let slow_pool = SlowWorkerPool::new(self.registry.clone(), self.writer.clone(), self.config.workers.slow);

        let drain_cancel = cancel.clone();
        let drain_summary = summary.clone();
        let fast_handle = tokio::spawn(async move { fast_pool.run(jobs, write_tx, drain_summary, drain_cancel).await });
        let slow_cancel = cancel.clone();
        let slow_handle = tokio::spawn(async move { slow_pool.run(write_rx, slow_cancel).await });

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            let _ = fast_handle.await;
            let _ = slow_handle.await;
        })
        .await
        .is_ok();

        cancel.cancel();
        let _ = maintenance_handle.await;
        ctrl_c.abort();

        if !drained {
            error!(group, "fast/slow pools did not drain within the shutdown grace period");
            return ExitCode::ShutdownTimeout;
        }

        if let Err(err) = self.maintenance.run_once().await {
            error!(group, error = %err, "final view refresh failed");
        }

        let summary = summary.lock().await;
        log_summary(group, &summary);

        if summary.is_clean_full_run() {
            if let Err(err) = self.advance_last_run(group) {
                error!(group, error = %err, "failed to persist lastRunTimestamp");
            }
        }

        if summary.any_fatal() {
            ExitCode::FatalIo
        } else {
            ExitCode::Clean
        }
    }

    fn advance_last_run(&self, group: &str) -> anyhow::Result<()> {
        let root = &self.config.storage.root;
        let mut runs = LastRuns::load(root)?;
        runs.record(group, chrono::Utc::now());
        runs.save(root)
    }
}

fn log_summary(group: &str, summary: &RunSummary) {
    for (table, counts) in &summary.per_table {
        info!(
            group,
            table,
            succeeded = counts.succeeded,
            empty_success = counts.empty_success,
            failed = counts.failed,
            skipped = counts.skipped,
            "table run summary"
        );
    }
}
