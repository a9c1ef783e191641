#![forbid(unsafe_code)]

use directive_harness_domain::{IdempotencyKey, Payload, RunId, RunRecord, RunStatus};
use serde::{Deserialize, Serialize};
use time::Duration;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    /// The store stayed locked past its busy timeout.
    #[error("ledger busy: {0}")]
    Busy(String),
    #[error("run {0} not found")]
    RunNotFound(RunId),
    #[error("run {run_id} is already terminal ({status})")]
    TerminalState { run_id: RunId, status: RunStatus },
    #[error("invalid transition for run {run_id}: {reason}")]
    InvalidTransition { run_id: RunId, reason: String },
    /// Another RUNNING or SUCCESS record already holds the idempotency key.
    #[error("idempotency key {key} is held by run {holder}")]
    Conflict { key: String, holder: RunId },
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Result of an atomic check-and-create on an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// A fresh RUNNING record was inserted for the caller.
    Claimed(RunId),
    /// A SUCCESS record exists; the caller must skip.
    AlreadySucceeded(RunRecord),
    /// Another caller holds a RUNNING record for the key.
    InFlight(RunRecord),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunFilter {
    pub directive_id: Option<String>,
    pub directive_version: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// Durable store of run records and the sole authority for skip/resume decisions.
///
/// Every method is applied as a single transaction against the backing store.
pub trait RunLedger {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> LedgerResult<()>;

    /// True iff a SUCCESS record exists for `key`. Never writes.
    #[allow(clippy::missing_errors_doc)]
    fn should_skip(&self, key: &IdempotencyKey) -> LedgerResult<bool>;

    /// Most recently created FAILED record for `key`.
    #[allow(clippy::missing_errors_doc)]
    fn get_last_failed_run(&self, key: &IdempotencyKey) -> LedgerResult<Option<RunRecord>>;

    /// Insert a new RUNNING record with zero retries.
    #[allow(clippy::missing_errors_doc)]
    fn create_run(&self, key: &IdempotencyKey) -> LedgerResult<RunId>;

    /// Skip check and create in one transaction. With `stale_after`, a RUNNING
    /// holder not updated within that window is failed with a timeout code and
    /// the key is claimed for the caller.
    #[allow(clippy::missing_errors_doc)]
    fn claim_run(
        &self,
        key: &IdempotencyKey,
        stale_after: Option<Duration>,
    ) -> LedgerResult<ClaimOutcome>;

    #[allow(clippy::missing_errors_doc)]
    fn update_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_code: Option<u8>,
        increment_retries: bool,
    ) -> LedgerResult<()>;

    #[allow(clippy::missing_errors_doc)]
    fn complete_run(
        &self,
        run_id: RunId,
        artifacts: Option<&Payload>,
        metrics: Option<&Payload>,
    ) -> LedgerResult<()>;

    #[allow(clippy::missing_errors_doc)]
    fn fail_run(&self, run_id: RunId, error_code: u8, metrics: Option<&Payload>)
        -> LedgerResult<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> LedgerResult<Option<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self, filter: &RunFilter) -> LedgerResult<Vec<RunRecord>>;

    /// Fail every RUNNING record whose last update is older than `older_than`.
    #[allow(clippy::missing_errors_doc)]
    fn reap_stale_runs(&self, older_than: Duration) -> LedgerResult<Vec<RunId>>;
}
