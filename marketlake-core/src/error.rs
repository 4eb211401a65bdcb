//! Error taxonomy shared by every stage of the pipeline (see spec §7).
//!
//! Errors inside a single job never escape their worker; they are folded into
//! a [`crate::outcome::RunSummary`] instead. Only a [`PlanError`] (see
//! `marketlake-planner`) and an [`AbortError`] unwind to the orchestrator.
//! Each boundary crate that raises its own error enum
//! (`marketlake-lake::WriteError`/`ReplaceError`, `marketlake-planner::PlanError`)
//! owns its definition rather than redefining one here — this module holds
//! only the enums consumed across crate boundaries by more than one caller.

use thiserror::Error;

/// Raised by `marketlake-fetch`. Classifies upstream failures so the fast
/// pool knows whether to retry.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("retryable upstream error: {0}")]
    Retryable(String),

    #[error("fatal upstream error: {0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Retryable(_))
    }
}

/// Raised by the State Queryer (spec §4.D).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("lake unreadable for table {table}: {reason}")]
    LakeUnreadable { table: String, reason: String },
}

/// Raised by the Schema Registry (spec §4.A).
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown table: {0}")]
    NotFound(String),
}

/// Unrecoverable condition that triggers graceful shutdown rather than being
/// accounted per-job (spec §7 `Aborting`: "cancellation or unrecoverable
/// invariant violation (e.g., backup directory already exists on
/// startup)"). Raised by the slow pool when a write hits
/// `marketlake_lake::ReplaceError::StaleBackup` and propagated up to cancel
/// the run rather than being folded into the table's fatal-job count.
#[derive(Debug, Error)]
pub enum AbortError {
    #[error("cancelled")]
    Cancelled,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Process exit codes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Clean = 0,
    PlanningAborted = 1,
    FatalIo = 2,
    ShutdownTimeout = 3,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}
