//! Task Planner (spec §4.G): enumerates `(table, entity)` fetch jobs for a
//! named task group, consulting the State Queryer for each table's
//! incremental watermark and filtering out jobs with no pending data.
//!
//! Planning is read-only and fails closed: any error while consulting the
//! registry or the state queryer aborts the whole plan (`PlanError::Aborted`)
//! before a single job is emitted (spec §7 `Planning`).

use std::collections::{HashMap, VecDeque};

use marketlake_core::config::{Config, UpdateStrategy};
use marketlake_core::dates;
use marketlake_core::job::Job;
use marketlake_schema::{SchemaEntry, SchemaRegistry};
use marketlake_state::StateQueryer;
use thiserror::Error;
use tracing::debug;

/// The distinguished full-replace table the entity universe is read from
/// (spec §3 "Entity lifecycle").
pub const INSTRUMENTS_TABLE: &str = "instruments";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planning aborted: unknown group {0}")]
    UnknownGroup(String),

    #[error("planning aborted: {0}")]
    Aborted(String),
}

impl From<marketlake_core::error::SchemaError> for PlanError {
    fn from(err: marketlake_core::error::SchemaError) -> Self {
        PlanError::Aborted(err.to_string())
    }
}

impl From<marketlake_core::error::StateError> for PlanError {
    fn from(err: marketlake_core::error::StateError) -> Self {
        PlanError::Aborted(err.to_string())
    }
}

pub struct TaskPlanner<'a> {
    config: &'a Config,
    registry: &'a SchemaRegistry,
    state: &'a StateQueryer,
}

impl<'a> TaskPlanner<'a> {
    pub fn new(config: &'a Config, registry: &'a SchemaRegistry, state: &'a StateQueryer) -> Self {
        Self { config, registry, state }
    }

    /// `plan(groupName, overrideEntities?)`.
    ///
    /// Jobs are interleaved round-robin across the group's tables (spec
    /// §4.G step 3) so the fetch queue stays diverse rather than draining
    /// one table at a time.
    pub fn plan(&self, group_name: &str, override_entities: Option<&[String]>) -> Result<Vec<Job>, PlanError> {
        let tables = self
            .config
            .groups
            .get(group_name)
            .ok_or_else(|| PlanError::UnknownGroup(group_name.to_string()))?;

        let mut per_table: Vec<VecDeque<Job>> = Vec::with_capacity(tables.len());
        for table in tables {
            let entry = self.registry.get(table)?;
            let jobs = self.plan_table(entry, override_entities)?;
            per_table.push(jobs.into());
        }

        Ok(interleave(per_table))
    }

    fn plan_table(&self, entry: &SchemaEntry, override_entities: Option<&[String]>) -> Result<Vec<Job>, PlanError> {
        let entities = self.resolve_entities(entry, override_entities)?;
        let mut jobs = Vec::with_capacity(entities.len());
        for entity in entities {
            if let Some(job) = self.plan_job(entry, &entity)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn resolve_entities(
        &self,
        entry: &SchemaEntry,
        override_entities: Option<&[String]>,
    ) -> Result<Vec<String>, PlanError> {
        if let Some(overridden) = override_entities {
            return Ok(overridden.to_vec());
        }

        let is_single_global_job = match entry.update_strategy {
            UpdateStrategy::FullReplace => entry.date_col.is_none(),
            // `update_by_symbol = false` means the table's incremental
            // bookkeeping is global (spec §3), so there is exactly one job
            // per run regardless of how many entities exist upstream —
            // enumerating the instruments table here would ask the state
            // queryer for a per-entity watermark on a table that has none.
            UpdateStrategy::Incremental => !entry.update_by_symbol,
        };
        if is_single_global_job {
            return Ok(vec![String::new()]);
        }

        let instruments = self.registry.get(INSTRUMENTS_TABLE)?;
        let entity_col = instruments
            .entity_column()
            .ok_or_else(|| PlanError::Aborted(format!("{INSTRUMENTS_TABLE} has no entity column")))?;
        Ok(self.state.entities_in_table(instruments, entity_col)?)
    }

    /// Computes one job (or a skip) for `(entry, entity)` per spec §4.G
    /// steps 2-3 and the time-of-day tie-break.
    fn plan_job(&self, entry: &SchemaEntry, entity: &str) -> Result<Option<Job>, PlanError> {
        if matches!(entry.update_strategy, UpdateStrategy::FullReplace) {
            let start_date = self.config.defaults.start_date.clone();
            return Ok(Some(self.build_job(entry, entity, start_date)));
        }

        let Some(_date_col) = entry.date_col.as_deref() else {
            let start_date = self.config.defaults.start_date.clone();
            return Ok(Some(self.build_job(entry, entity, start_date)));
        };

        let owned_entity;
        let entities: &[String] = if entity.is_empty() {
            &[]
        } else {
            owned_entity = vec![entity.to_string()];
            &owned_entity
        };
        let max_dates = self.state.max_date(entry, entities)?;
        let key = if entity.is_empty() { "" } else { entity };
        let max_date = max_dates.get(key).cloned();

        let expected_latest = expected_latest_trading_day();
        let end_date = &self.config.defaults.end_date;

        let start_date = match max_date {
            None => self.config.defaults.start_date.clone(),
            Some(max) if max == expected_latest => {
                if dates::current_local_hour() < self.config.defaults.market_close_hour {
                    debug!(table = %entry.name, entity, "caught up to latest trading day before market close, skipping");
                    return Ok(None);
                }
                dates::today()
            }
            Some(max) => dates::add_days(&max, 1).map_err(|e| PlanError::Aborted(e.to_string()))?,
        };

        if &start_date > end_date || start_date > expected_latest {
            debug!(table = %entry.name, entity, start_date, "no pending data, skipping");
            return Ok(None);
        }

        Ok(Some(self.build_job(entry, entity, start_date)))
    }

    /// Builds the emitted job, carrying the computed entity and date window
    /// into `Job.params` so the fast pool's fetch call actually asks the
    /// upstream API for this entity and range rather than just the table's
    /// `required_params` (spec §4.F `fetch(table, params)`; original
    /// `fetch_daily_history(ts_code, start_date, end_date, ...)`).
    fn build_job(&self, entry: &SchemaEntry, entity: &str, start_date: String) -> Job {
        let mut params = HashMap::new();
        if !entity.is_empty() {
            params.insert("ts_code".to_string(), entity.to_string());
        }
        params.insert("start_date".to_string(), start_date.clone());
        params.insert("end_date".to_string(), self.config.defaults.end_date.clone());
        Job::new(entry.name.as_str(), entity, start_date).with_params(params)
    }
}

/// Today, rolled back to the most recent weekday — a deliberately simple
/// trading-calendar stand-in (spec §4.G, `dates::latest_weekday_on_or_before`
/// doc comment).
fn expected_latest_trading_day() -> String {
    let today = chrono::Utc::now().date_naive();
    dates::format(dates::latest_weekday_on_or_before(today))
}

/// Round-robins across each table's already-ordered job queue until all are
/// drained (spec §4.G step 3).
fn interleave(mut per_table: Vec<VecDeque<Job>>) -> Vec<Job> {
    let total: usize = per_table.iter().map(VecDeque::len).sum();
    let mut out = Vec::with_capacity(total);
    loop {
        let mut progressed = false;
        for queue in per_table.iter_mut() {
            if let Some(job) = queue.pop_front() {
                out.push(job);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    out
}
