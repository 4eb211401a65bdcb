//! Fast Worker Pool (spec §4.H): bounded-concurrency fetch workers that
//! acquire a per-table rate-limit token, invoke the Fetcher, retry
//! retryable failures with backoff, and forward successful non-empty
//! batches onto the write queue.
//!
//! A retry does not tie up its worker for the whole backoff delay — the
//! delay is awaited in a detached task that re-enqueues the job onto the
//! same fetch queue, so the worker is free to pull other jobs meanwhile
//! (spec §5 "no single table can starve the rate limiter", §4.H "other jobs
//! unaffected").

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use marketlake_core::config::Config;
use marketlake_core::job::{Job, WriteJob};
use marketlake_core::outcome::{JobOutcome, RunSummary};
use marketlake_fetch::Fetcher;
use marketlake_ratelimit::RateLimitRegistry;
use marketlake_schema::SchemaRegistry;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::retry::delay_for_attempt;

pub struct FastWorkerPool {
    registry: Arc<SchemaRegistry>,
    fetcher: Arc<dyn Fetcher>,
    rate_limits: Arc<RateLimitRegistry>,
    config: Arc<Config>,
}

impl FastWorkerPool {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        fetcher: Arc<dyn Fetcher>,
        rate_limits: Arc<RateLimitRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self { registry, fetcher, rate_limits, config }
    }

    /// Runs `jobs` to completion: every job (including every retry it
    /// spawns) reaches a terminal outcome before this returns, unless
    /// `cancel` fires first, in which case in-flight jobs finish but no new
    /// ones start and pending retries are abandoned (spec §4.H
    /// "Cancellation").
    pub async fn run(
        &self,
        jobs: Vec<Job>,
        write_tx: mpsc::Sender<WriteJob>,
        summary: Arc<Mutex<RunSummary>>,
        cancel: CancellationToken,
    ) {
        if jobs.is_empty() {
            return;
        }

        let worker_count = self.config.workers.fast.max(1);
        let queue_capacity = jobs.len() + worker_count;
        let (job_tx, job_rx) = mpsc::channel::<Job>(queue_capacity);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let outstanding = Arc::new(AtomicI64::new(jobs.len() as i64));
        let intake_done = CancellationToken::new();

        for job in jobs {
            if job_tx.send(job).await.is_err() {
                break;
            }
        }

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let job_rx = job_rx.clone();
            let job_tx = job_tx.clone();
            let registry = self.registry.clone();
            let fetcher = self.fetcher.clone();
            let rate_limits = self.rate_limits.clone();
            let config = self.config.clone();
            let write_tx = write_tx.clone();
            let summary = summary.clone();
            let outstanding = outstanding.clone();
            let intake_done = intake_done.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            _ = intake_done.cancelled() => None,
                            maybe = rx.recv() => maybe,
                        }
                    };
                    let Some(job) = job else { break };

                    let terminal = process_job(
                        job,
                        &registry,
                        fetcher.as_ref(),
                        &rate_limits,
                        &config,
                        &write_tx,
                        &summary,
                        &job_tx,
                        &cancel,
                        &intake_done,
                        &outstanding,
                    )
                    .await;

                    if terminal && outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                        intake_done.cancel();
                    }
                }
            }));
        }
        drop(job_tx);

        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Runs one attempt of `job`: rate-limit acquire, fetch, classify. Returns
/// `true` if the job reached a terminal outcome (success, empty success,
/// fatal, retry exhaustion, or cancellation) and `false` if a retry was
/// scheduled.
#[allow(clippy::too_many_arguments)]
async fn process_job(
    job: Job,
    registry: &SchemaRegistry,
    fetcher: &(dyn Fetcher),
    rate_limits: &RateLimitRegistry,
    config: &Config,
    write_tx: &mpsc::Sender<WriteJob>,
    summary: &Arc<Mutex<RunSummary>>,
    job_tx: &mpsc::Sender<Job>,
    cancel: &CancellationToken,
    intake_done: &CancellationToken,
    outstanding: &Arc<AtomicI64>,
) -> bool {
    let entry = match registry.get(&job.table) {
        Ok(entry) => entry,
        Err(err) => {
            summary.lock().await.record(&job.table, JobOutcome::FailedFatal);
            warn!(table = %job.table, entity = %job.entity, error = %err, "unknown table, dropping job");
            return true;
        }
    };

    let rate_limit = config.rate_limit_for(&job.table);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(table = %job.table, entity = %job.entity, "cancelled while waiting for rate-limit token");
            return true;
        }
        _ = rate_limits.acquire(&job.table, rate_limit) => {}
    }

    match fetcher.fetch(entry, &job.params).await {
        Ok(batch) if batch.num_rows() == 0 => {
            summary.lock().await.record(&job.table, JobOutcome::EmptySuccess);
            info!(table = %job.table, entity = %job.entity, attempt = job.attempt, outcome = "empty_success", "fetch returned no rows");
            true
        }
        Ok(batch) => {
            let rows = batch.num_rows();
            summary.lock().await.record(&job.table, JobOutcome::Succeeded);
            info!(table = %job.table, entity = %job.entity, attempt = job.attempt, outcome = "succeeded", rows, "fetch succeeded");
            let write_job = WriteJob { table: job.table.clone(), entity: job.entity.clone(), batch };
            if write_tx.send(write_job).await.is_err() {
                warn!(table = %job.table, entity = %job.entity, "write queue closed, dropping fetched batch");
            }
            true
        }
        Err(err) if err.is_retryable() => {
            let policy = config.retry_for(&job.table);
            if job.attempt >= policy.max_attempts {
                summary.lock().await.record(&job.table, JobOutcome::FailedRetryExhausted);
                warn!(table = %job.table, entity = %job.entity, attempt = job.attempt, outcome = "failed_retry_exhausted", error = %err, "retry attempts exhausted");
                true
            } else {
                let delay = delay_for_attempt(&policy, job.attempt);
                info!(table = %job.table, entity = %job.entity, attempt = job.attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
                schedule_retry(job_tx.clone(), job.next_attempt(), delay, cancel.clone(), intake_done.clone(), outstanding.clone());
                false
            }
        }
        Err(err) => {
            summary.lock().await.record(&job.table, JobOutcome::FailedFatal);
            warn!(table = %job.table, entity = %job.entity, attempt = job.attempt, outcome = "failed_fatal", error = %err, "fatal upstream error");
            true
        }
    }
}

/// Sleeps off one retry's backoff delay in a detached task, then re-enqueues
/// the job. Cooperates with cancellation: a cancelled wait drops the job
/// without requeueing rather than blocking shutdown (spec §8 "Shutdown
/// during a fetch retry wait: worker wakes within the grace window").
fn schedule_retry(
    job_tx: mpsc::Sender<Job>,
    job: Job,
    delay: std::time::Duration,
    cancel: CancellationToken,
    intake_done: CancellationToken,
    outstanding: Arc<AtomicI64>,
) {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(table = %job.table, entity = %job.entity, attempt = job.attempt, "cancelled during retry wait, dropping job");
                if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                    intake_done.cancel();
                }
            }
            _ = tokio::time::sleep(delay) => {
                if job_tx.send(job).await.is_err() && outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                    intake_done.cancel();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::arrow::record_batch::RecordBatch;
    use marketlake_core::config::{BackoffKind, RetryConfig, UpdateStrategy, WorkersConfig};
    use marketlake_core::error::FetchError;
    use marketlake_schema::SchemaEntry;

    fn empty_batch() -> RecordBatch {
        RecordBatch::new_empty(Arc::new(Schema::empty()))
    }

    fn one_row_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))]).unwrap()
    }

    fn test_config() -> Config {
        Config {
            storage: marketlake_core::config::StorageConfig { root: "/tmp/does-not-matter".into() },
            rate_limits: StdHashMap::new(),
            workers: WorkersConfig { fast: 2, slow: 1 },
            retry: StdHashMap::from([(
                "daily".to_string(),
                RetryConfig { max_attempts: 3, backoff: BackoffKind::Fixed, base_delay_ms: 1, max_delay_ms: 5, factor: 1.0 },
            )]),
            groups: StdHashMap::new(),
            tables: StdHashMap::new(),
            defaults: marketlake_core::config::DefaultsConfig {
                start_date: "19900101".to_string(),
                end_date: "19991231".to_string(),
                market_close_hour: 16,
            },
            maintenance: Default::default(),
        }
    }

    fn daily_entry() -> SchemaEntry {
        SchemaEntry {
            name: "daily".to_string(),
            primary_key: vec!["symbol".to_string()],
            date_col: None,
            update_strategy: UpdateStrategy::Incremental,
            update_by_symbol: true,
            upstream_api_id: "daily".to_string(),
            required_params: StdHashMap::new(),
            revision_col: None,
            reporting_period_col: None,
            entity_col: None,
        }
    }

    fn registry_with_daily() -> SchemaRegistry {
        SchemaRegistry::from_toml_str(
            r#"
[daily]
primary_key = ["symbol"]
update_strategy = "incremental"
update_by_symbol = true
upstream_api_id = "daily"
"#,
        )
        .unwrap()
    }

    /// Returns `outcomes[call_count]` (clamped to the last entry) on each
    /// call, regardless of which job is asked for — enough to script a
    /// fixed sequence of retryable failures followed by a success.
    struct ScriptedFetcher {
        outcomes: Vec<Result<RecordBatch, FetchError>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, _entry: &SchemaEntry, _params: &StdHashMap<String, String>) -> Result<RecordBatch, FetchError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = idx.min(self.outcomes.len() - 1);
            match &self.outcomes[idx] {
                Ok(batch) => Ok(batch.clone()),
                Err(FetchError::Retryable(msg)) => Err(FetchError::Retryable(msg.clone())),
                Err(FetchError::Fatal(msg)) => Err(FetchError::Fatal(msg.clone())),
            }
        }
    }

    async fn run_pool(fetcher: ScriptedFetcher, jobs: Vec<Job>) -> (RunSummary, Vec<WriteJob>) {
        let registry = Arc::new(registry_with_daily());
        let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher);
        let rate_limits = Arc::new(RateLimitRegistry::new());
        let config = Arc::new(test_config());
        let pool = FastWorkerPool::new(registry, fetcher, rate_limits, config);

        let (write_tx, mut write_rx) = mpsc::channel(16);
        let summary = Arc::new(Mutex::new(RunSummary::new(false)));
        let cancel = CancellationToken::new();

        pool.run(jobs, write_tx.clone(), summary.clone(), cancel).await;
        drop(write_tx);

        let mut writes = Vec::new();
        while let Some(job) = write_rx.recv().await {
            writes.push(job);
        }
        let summary = Arc::try_unwrap(summary).unwrap().into_inner();
        (summary, writes)
    }

    #[tokio::test]
    async fn successful_fetch_is_forwarded_to_the_write_queue() {
        let fetcher = ScriptedFetcher { outcomes: vec![Ok(one_row_batch())], calls: AtomicUsize::new(0) };
        let jobs = vec![Job::new("daily", "AAPL", "19900101")];
        let (summary, writes) = run_pool(fetcher, jobs).await;

        assert_eq!(summary.per_table["daily"].succeeded, 1);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].entity, "AAPL");
    }

    #[tokio::test]
    async fn empty_batch_is_counted_but_not_forwarded() {
        let fetcher = ScriptedFetcher { outcomes: vec![Ok(empty_batch())], calls: AtomicUsize::new(0) };
        let jobs = vec![Job::new("daily", "AAPL", "19900101")];
        let (summary, writes) = run_pool(fetcher, jobs).await;

        assert_eq!(summary.per_table["daily"].empty_success, 1);
        assert!(writes.is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_until_success() {
        let fetcher = ScriptedFetcher {
            outcomes: vec![
                Err(FetchError::Retryable("503".to_string())),
                Err(FetchError::Retryable("503".to_string())),
                Ok(one_row_batch()),
            ],
            calls: AtomicUsize::new(0),
        };
        let jobs = vec![Job::new("daily", "AAPL", "19900101")];
        let (summary, writes) = run_pool(fetcher, jobs).await;

        assert_eq!(summary.per_table["daily"].succeeded, 1);
        assert_eq!(summary.per_table["daily"].failed, 0);
        assert_eq!(writes.len(), 1);
    }

    #[tokio::test]
    async fn retries_exhausted_records_failure_without_writing() {
        let fetcher = ScriptedFetcher {
            outcomes: vec![Err(FetchError::Retryable("503".to_string()))],
            calls: AtomicUsize::new(0),
        };
        let jobs = vec![Job::new("daily", "AAPL", "19900101")];
        let (summary, writes) = run_pool(fetcher, jobs).await;

        assert_eq!(summary.per_table["daily"].failed, 1);
        assert!(writes.is_empty());
    }

    #[tokio::test]
    async fn fatal_error_fails_without_retrying() {
        let fetcher = ScriptedFetcher {
            outcomes: vec![Err(FetchError::Fatal("404".to_string())), Ok(one_row_batch())],
            calls: AtomicUsize::new(0),
        };
        let jobs = vec![Job::new("daily", "AAPL", "19900101")];
        let (summary, writes) = run_pool(fetcher, jobs).await;

        assert_eq!(summary.per_table["daily"].failed, 1);
        assert_eq!(summary.per_table["daily"].succeeded, 0);
        assert!(writes.is_empty());
    }

    #[tokio::test]
    async fn unknown_table_is_dropped_as_a_fatal_failure() {
        let fetcher = ScriptedFetcher { outcomes: vec![Ok(one_row_batch())], calls: AtomicUsize::new(0) };
        let jobs = vec![Job::new("not_a_table", "AAPL", "19900101")];
        let (summary, writes) = run_pool(fetcher, jobs).await;

        assert_eq!(summary.per_table["not_a_table"].failed, 1);
        assert!(writes.is_empty());
    }

    #[tokio::test]
    async fn empty_job_list_returns_immediately_without_panicking() {
        let fetcher = ScriptedFetcher { outcomes: vec![Ok(one_row_batch())], calls: AtomicUsize::new(0) };
        let (summary, writes) = run_pool(fetcher, vec![]).await;

        assert!(summary.per_table.is_empty());
        assert!(writes.is_empty());
    }

    #[test]
    fn daily_entry_fixture_is_incremental() {
        // sanity check the fixture used for manual inspection above stays in
        // sync with the registry-driven fixture the async tests exercise.
        assert!(daily_entry().is_incremental());
    }
}
