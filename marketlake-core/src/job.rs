//! The unit of work passed between the planner, the fast pool and the slow
//! pool (spec §2, §4.G–§4.I).

use std::collections::HashMap;

use datafusion::arrow::record_batch::RecordBatch;

/// One `(table, entity)` fetch job, as emitted by the Task Planner.
///
/// `entity` is the empty string for tables whose incremental state is global
/// (`update_by_symbol = false`) or for the single job of a non-partitioned
/// full-replace table (spec §4.G).
#[derive(Debug, Clone)]
pub struct Job {
    pub table: String,
    pub entity: String,
    pub start_date: String,
    pub attempt: u32,
    pub params: HashMap<String, String>,
}

impl Job {
    pub fn new(table: impl Into<String>, entity: impl Into<String>, start_date: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            entity: entity.into(),
            start_date: start_date.into(),
            attempt: 1,
            params: HashMap::new(),
        }
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// A copy of this job for its next retry attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// A successfully fetched batch, handed from the fast pool to the slow pool
/// over the write queue.
#[derive(Debug)]
pub struct WriteJob {
    pub table: String,
    pub entity: String,
    pub batch: RecordBatch,
}
