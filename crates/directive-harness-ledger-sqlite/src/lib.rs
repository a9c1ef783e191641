#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};
use std::str::FromStr;

use directive_harness_domain::{
    format_rfc3339, now_utc, parse_rfc3339, DateTimeUtc, ExitCode, Fingerprint, IdempotencyKey,
    Payload, RunId, RunRecord, RunStatus,
};
use directive_harness_ledger_core::{ClaimOutcome, LedgerError, LedgerResult, RunFilter, RunLedger};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde::Deserialize;
use serde_json::{json, Value};
use time::Duration;

const LEDGER_SCHEMA_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const RUN_COLUMNS: &str = "run_id, directive_id, directive_version, fingerprint, status, \
     retries, error_code, artifacts_json, metrics_json, created_at, updated_at";

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL UNIQUE,
  directive_id TEXT NOT NULL,
  directive_version TEXT NOT NULL,
  fingerprint TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','running','success','failed','skipped')),
  retries INTEGER NOT NULL DEFAULT 0 CHECK (retries >= 0),
  error_code INTEGER CHECK (error_code IS NULL OR error_code BETWEEN 0 AND 8),
  artifacts_json TEXT NOT NULL DEFAULT '{}',
  metrics_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK ((status IN ('success','failed')) = (error_code IS NOT NULL)),
  CHECK (status <> 'success' OR error_code = 0),
  CHECK (status <> 'failed' OR error_code > 0)
);

CREATE INDEX IF NOT EXISTS idx_runs_idempotency
  ON runs(directive_id, directive_version, fingerprint, status);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_single_holder
  ON runs(directive_id, directive_version, fingerprint)
  WHERE status IN ('running','success');

CREATE TRIGGER IF NOT EXISTS trg_runs_terminal_immutable
BEFORE UPDATE ON runs
WHEN OLD.status IN ('success','failed')
BEGIN
  SELECT RAISE(ABORT, 'terminal runs are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_identity_immutable
BEFORE UPDATE OF run_id, directive_id, directive_version, fingerprint, created_at ON runs
WHEN NEW.run_id IS NOT OLD.run_id
  OR NEW.directive_id IS NOT OLD.directive_id
  OR NEW.directive_version IS NOT OLD.directive_version
  OR NEW.fingerprint IS NOT OLD.fingerprint
  OR NEW.created_at IS NOT OLD.created_at
BEGIN
  SELECT RAISE(ABORT, 'run identity columns are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_retries_monotonic
BEFORE UPDATE OF retries ON runs
WHEN NEW.retries < OLD.retries
BEGIN
  SELECT RAISE(ABORT, 'retries never decrease');
END;
";

/// Connection settings for a ledger file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl LedgerConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    #[must_use]
    pub fn with_busy_timeout_ms(mut self, busy_timeout_ms: u64) -> Self {
        self.busy_timeout_ms = busy_timeout_ms;
        self
    }
}

const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

pub struct SqliteRunLedger {
    conn: Connection,
}

impl SqliteRunLedger {
    /// Open or create a ledger database with the default busy timeout.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        Self::open_with(&LedgerConfig::new(path))
    }

    /// Open or create a ledger database and configure local pragmas.
    pub fn open_with(config: &LedgerConfig) -> LedgerResult<Self> {
        let conn = Connection::open(&config.path).map_err(|err| {
            sql_error(
                &format!(
                    "failed to open sqlite database at {}",
                    config.path.display()
                ),
                err,
            )
        })?;

        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
            .map_err(|err| sql_error("failed to set busy timeout", err))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|err| sql_error("failed to configure sqlite pragmas", err))?;

        Ok(Self { conn })
    }

    /// Begin a transaction that takes the write lock up front, so concurrent
    /// writers queue on the busy timeout instead of failing on lock upgrade.
    fn write_tx(&self) -> LedgerResult<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(|err| sql_error("failed to begin write transaction", err))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RunLedger for SqliteRunLedger {
    fn migrate(&self) -> LedgerResult<()> {
        let tx = self.write_tx()?;
        tx.execute_batch(SCHEMA_V1)
            .map_err(|err| sql_error("failed to apply ledger schema", err))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![LEDGER_SCHEMA_VERSION, timestamp(now_utc())?],
        )
        .map_err(|err| sql_error("failed to record ledger migration", err))?;
        tx.commit()
            .map_err(|err| sql_error("failed to commit ledger migration", err))
    }

    fn should_skip(&self, key: &IdempotencyKey) -> LedgerResult<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM runs
                 WHERE directive_id = ?1 AND directive_version = ?2
                   AND fingerprint = ?3 AND status = 'success'
                 LIMIT 1",
                key_params(key),
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(|err| sql_error("failed to query skip decision", err))
    }

    fn get_last_failed_run(&self, key: &IdempotencyKey) -> LedgerResult<Option<RunRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs
                     WHERE directive_id = ?1 AND directive_version = ?2
                       AND fingerprint = ?3 AND status = 'failed'
                     ORDER BY run_seq DESC
                     LIMIT 1"
                ),
                key_params(key),
                parse_run_row,
            )
            .optional()
            .map_err(|err| sql_error("failed to load last failed run", err))
    }

    fn create_run(&self, key: &IdempotencyKey) -> LedgerResult<RunId> {
        let tx = self.write_tx()?;
        if let Some(holder) = find_holder(&tx, key)? {
            return Err(LedgerError::Conflict {
                key: key.to_string(),
                holder: holder.run_id,
            });
        }
        let run_id = insert_running(&tx, key)?;
        tx.commit()
            .map_err(|err| sql_error("failed to commit run creation", err))?;
        Ok(run_id)
    }

    fn claim_run(
        &self,
        key: &IdempotencyKey,
        stale_after: Option<Duration>,
    ) -> LedgerResult<ClaimOutcome> {
        let tx = self.write_tx()?;

        if let Some(holder) = find_holder(&tx, key)? {
            match holder.status {
                RunStatus::Success => return Ok(ClaimOutcome::AlreadySucceeded(holder)),
                RunStatus::Running => {
                    let now = now_utc();
                    let stale = stale_after.is_some_and(|window| holder.updated_at + window <= now);
                    if !stale {
                        return Ok(ClaimOutcome::InFlight(holder));
                    }
                    reap_run(&tx, &holder, now)?;
                    tracing::warn!(
                        run_id = %holder.run_id,
                        key = %key,
                        "reaped stale running record before claim"
                    );
                }
                other => {
                    return Err(LedgerError::Corrupt(format!(
                        "run {} holds {key} with status {other}",
                        holder.run_id
                    )))
                }
            }
        }

        let run_id = insert_running(&tx, key)?;
        tx.commit()
            .map_err(|err| sql_error("failed to commit claim", err))?;
        tracing::debug!(run_id = %run_id, key = %key, "claimed idempotency key");
        Ok(ClaimOutcome::Claimed(run_id))
    }

    fn update_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_code: Option<u8>,
        increment_retries: bool,
    ) -> LedgerResult<()> {
        let stored_code = storable_error_code(run_id, status, error_code)?;

        let tx = self.write_tx()?;
        ensure_mutable(&tx, run_id)?;
        tx.execute(
            "UPDATE runs SET
                status = ?2,
                error_code = ?3,
                retries = retries + ?4,
                updated_at = ?5
             WHERE run_id = ?1",
            params![
                run_id.to_string(),
                status.as_str(),
                stored_code.map(i64::from),
                i64::from(increment_retries),
                timestamp(now_utc())?,
            ],
        )
        .map_err(|err| sql_error("failed to update run status", err))?;
        tx.commit()
            .map_err(|err| sql_error("failed to commit status update", err))
    }

    fn complete_run(
        &self,
        run_id: RunId,
        artifacts: Option<&Payload>,
        metrics: Option<&Payload>,
    ) -> LedgerResult<()> {
        let artifacts_json = artifacts.map(payload_json).transpose()?;
        let metrics_json = metrics.map(payload_json).transpose()?;

        let tx = self.write_tx()?;
        ensure_mutable(&tx, run_id)?;
        tx.execute(
            "UPDATE runs SET
                status = 'success',
                error_code = 0,
                artifacts_json = COALESCE(?2, artifacts_json),
                metrics_json = COALESCE(?3, metrics_json),
                updated_at = ?4
             WHERE run_id = ?1",
            params![
                run_id.to_string(),
                artifacts_json,
                metrics_json,
                timestamp(now_utc())?,
            ],
        )
        .map_err(|err| sql_error("failed to complete run", err))?;
        tx.commit()
            .map_err(|err| sql_error("failed to commit run completion", err))
    }

    fn fail_run(
        &self,
        run_id: RunId,
        error_code: u8,
        metrics: Option<&Payload>,
    ) -> LedgerResult<()> {
        let stored_code = storable_error_code(run_id, RunStatus::Failed, Some(error_code))?;
        let metrics_json = metrics.map(payload_json).transpose()?;

        let tx = self.write_tx()?;
        ensure_mutable(&tx, run_id)?;
        tx.execute(
            "UPDATE runs SET
                status = 'failed',
                error_code = ?2,
                metrics_json = COALESCE(?3, metrics_json),
                updated_at = ?4
             WHERE run_id = ?1",
            params![
                run_id.to_string(),
                stored_code.map(i64::from),
                metrics_json,
                timestamp(now_utc())?,
            ],
        )
        .map_err(|err| sql_error("failed to fail run", err))?;
        tx.commit()
            .map_err(|err| sql_error("failed to commit run failure", err))
    }

    fn get_run(&self, run_id: RunId) -> LedgerResult<Option<RunRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id.to_string()],
                parse_run_row,
            )
            .optional()
            .map_err(|err| sql_error("failed to load run", err))
    }

    fn list_runs(&self, filter: &RunFilter) -> LedgerResult<Vec<RunRecord>> {
        let mut conditions = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(directive_id) = &filter.directive_id {
            values.push(directive_id.clone());
            conditions.push(format!("directive_id = ?{}", values.len()));
        }
        if let Some(directive_version) = &filter.directive_version {
            values.push(directive_version.clone());
            conditions.push(format!("directive_version = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            conditions.push(format!("status = ?{}", values.len()));
        }

        let mut query = format!("SELECT {RUN_COLUMNS} FROM runs");
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY run_seq DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ");
            query.push_str(&limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| sql_error("failed to prepare run listing", err))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), parse_run_row)
            .map_err(|err| sql_error("failed to list runs", err))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|err| sql_error("failed to read run row", err))?);
        }
        Ok(out)
    }

    fn reap_stale_runs(&self, older_than: Duration) -> LedgerResult<Vec<RunId>> {
        let tx = self.write_tx()?;
        let now = now_utc();

        let running = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'running' ORDER BY run_seq ASC"
                ))
                .map_err(|err| sql_error("failed to prepare stale scan", err))?;
            let rows = stmt
                .query_map([], parse_run_row)
                .map_err(|err| sql_error("failed to scan running records", err))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|err| sql_error("failed to read run row", err))?);
            }
            out
        };

        let mut reaped = Vec::new();
        for record in running {
            if record.updated_at + older_than <= now {
                reap_run(&tx, &record, now)?;
                reaped.push(record.run_id);
            }
        }

        tx.commit()
            .map_err(|err| sql_error("failed to commit stale reap", err))?;
        if !reaped.is_empty() {
            tracing::warn!(count = reaped.len(), "reaped stale running records");
        }
        Ok(reaped)
    }
}

fn key_params(key: &IdempotencyKey) -> [&str; 3] {
    [
        key.directive_id.as_str(),
        key.directive_version.as_str(),
        key.fingerprint.as_str(),
    ]
}

/// The RUNNING or SUCCESS record currently holding `key`, if any.
fn find_holder(conn: &Connection, key: &IdempotencyKey) -> LedgerResult<Option<RunRecord>> {
    conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE directive_id = ?1 AND directive_version = ?2
               AND fingerprint = ?3 AND status IN ('running','success')
             ORDER BY run_seq DESC
             LIMIT 1"
        ),
        key_params(key),
        parse_run_row,
    )
    .optional()
    .map_err(|err| sql_error("failed to look up key holder", err))
}

fn insert_running(conn: &Connection, key: &IdempotencyKey) -> LedgerResult<RunId> {
    let run_id = RunId::new();
    let now = timestamp(now_utc())?;
    conn.execute(
        "INSERT INTO runs(
            run_id, directive_id, directive_version, fingerprint,
            status, retries, artifacts_json, metrics_json, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, 'running', 0, '{}', '{}', ?5, ?5)",
        params![
            run_id.to_string(),
            key.directive_id,
            key.directive_version,
            key.fingerprint.as_str(),
            now,
        ],
    )
    .map_err(|err| sql_error("failed to insert run", err))?;
    Ok(run_id)
}

fn ensure_mutable(conn: &Connection, run_id: RunId) -> LedgerResult<()> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM runs WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| sql_error("failed to load run status", err))?;

    let Some(raw) = status else {
        return Err(LedgerError::RunNotFound(run_id));
    };
    let status = RunStatus::parse(&raw)
        .ok_or_else(|| LedgerError::Corrupt(format!("unknown status {raw} on run {run_id}")))?;
    if status.is_terminal() {
        return Err(LedgerError::TerminalState { run_id, status });
    }
    Ok(())
}

fn reap_run(conn: &Connection, record: &RunRecord, now: DateTimeUtc) -> LedgerResult<()> {
    let mut metrics = record.metrics.clone();
    metrics.insert("reaped".to_string(), Value::Bool(true));
    metrics.insert("reaped_at".to_string(), json!(timestamp(now)?));
    let stale_for_ms =
        i64::try_from((now - record.updated_at).whole_milliseconds()).unwrap_or(i64::MAX);
    metrics.insert("stale_for_ms".to_string(), json!(stale_for_ms));

    conn.execute(
        "UPDATE runs SET
            status = 'failed',
            error_code = ?2,
            metrics_json = ?3,
            updated_at = ?4
         WHERE run_id = ?1 AND status = 'running'",
        params![
            record.run_id.to_string(),
            i64::from(ExitCode::Timeout.code()),
            payload_json(&metrics)?,
            timestamp(now)?,
        ],
    )
    .map_err(|err| sql_error("failed to reap stale run", err))?;
    Ok(())
}

/// Normalizes the error code for a target status, rejecting combinations the
/// ledger never stores.
fn storable_error_code(
    run_id: RunId,
    status: RunStatus,
    error_code: Option<u8>,
) -> LedgerResult<Option<u8>> {
    let invalid = |reason: String| LedgerError::InvalidTransition { run_id, reason };
    match status {
        RunStatus::Pending | RunStatus::Skipped => Err(invalid(format!(
            "{status} is never persisted; skips are read-only decisions"
        ))),
        RunStatus::Running => match error_code {
            None => Ok(None),
            Some(code) => Err(invalid(format!(
                "running records carry no error code (got {code})"
            ))),
        },
        RunStatus::Success => match error_code {
            None | Some(0) => Ok(Some(0)),
            Some(code) => Err(invalid(format!(
                "success records carry error code 0 (got {code})"
            ))),
        },
        RunStatus::Failed => match error_code {
            Some(code) if code > 0 && ExitCode::from_code(i64::from(code)).is_ok() => {
                Ok(Some(code))
            }
            Some(code) => Err(invalid(format!(
                "failed records need an error code in 1..=8 (got {code})"
            ))),
            None => Err(invalid("failed records need an error code".to_string())),
        },
    }
}

fn payload_json(payload: &Payload) -> LedgerResult<String> {
    serde_json::to_string(payload)
        .map_err(|err| LedgerError::Storage(format!("failed to serialize payload: {err}")))
}

fn timestamp(value: DateTimeUtc) -> LedgerResult<String> {
    format_rfc3339(value).map_err(|err| LedgerError::Storage(err.to_string()))
}

fn sql_error(context: &str, err: rusqlite::Error) -> LedgerError {
    if matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    ) {
        return LedgerError::Busy(format!("{context}: {err}"));
    }
    if matches!(err, rusqlite::Error::FromSqlConversionFailure(..)) {
        return LedgerError::Corrupt(format!("{context}: {err}"));
    }
    LedgerError::Storage(format!("{context}: {err}"))
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_id_raw: String = row.get(0)?;
    let fingerprint_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let retries_raw: i64 = row.get(5)?;
    let error_code_raw: Option<i64> = row.get(6)?;
    let artifacts_raw: String = row.get(7)?;
    let metrics_raw: String = row.get(8)?;
    let created_raw: String = row.get(9)?;
    let updated_raw: String = row.get(10)?;

    let run_id = RunId::from_str(&run_id_raw).map_err(|err| invalid_column(0, err.to_string()))?;
    let fingerprint = Fingerprint::from_str(&fingerprint_raw)
        .map_err(|err| invalid_column(3, err.to_string()))?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(4, format!("invalid status: {status_raw}")))?;
    let retries = u32::try_from(retries_raw)
        .map_err(|_| invalid_column(5, format!("invalid retries: {retries_raw}")))?;
    let error_code = error_code_raw
        .map(|code| {
            u8::try_from(code).map_err(|_| invalid_column(6, format!("invalid error_code: {code}")))
        })
        .transpose()?;
    let artifacts: Payload = serde_json::from_str(&artifacts_raw)
        .map_err(|err| invalid_column(7, format!("invalid artifacts_json: {err}")))?;
    let metrics: Payload = serde_json::from_str(&metrics_raw)
        .map_err(|err| invalid_column(8, format!("invalid metrics_json: {err}")))?;
    let created_at =
        parse_rfc3339(&created_raw).map_err(|err| invalid_column(9, err.to_string()))?;
    let updated_at =
        parse_rfc3339(&updated_raw).map_err(|err| invalid_column(10, err.to_string()))?;

    Ok(RunRecord {
        run_id,
        directive_id: row.get(1)?,
        directive_version: row.get(2)?,
        fingerprint,
        status,
        retries,
        error_code,
        artifacts,
        metrics,
        created_at,
        updated_at,
    })
}
