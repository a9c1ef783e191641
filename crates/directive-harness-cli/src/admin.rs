//! `dh-ledger`: inspection and maintenance of a run ledger.

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use directive_harness_contract::{keyed_input, Directive};
use directive_harness_domain::{
    canonical_bytes, fingerprint, format_rfc3339, Fingerprint, IdempotencyKey, RunId, RunRecord,
    RunStatus,
};
use directive_harness_ledger_core::{RunFilter, RunLedger};
use directive_harness_ledger_sqlite::{LedgerConfig, SqliteRunLedger};
use serde_json::{json, Value};

use crate::directives::{EchoDirective, WriteNoteDirective};
use crate::read_raw_input;

#[derive(Debug, Parser)]
#[command(name = "dh-ledger")]
#[command(about = "Inspect and maintain a directive run ledger")]
pub struct LedgerCli {
    #[command(subcommand)]
    pub command: LedgerCommand,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    /// Show one run record.
    Show {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        run_id: String,
    },
    /// List run records, newest first.
    List {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        directive_id: Option<String>,
        #[arg(long)]
        directive_version: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Most recent failed run for an idempotency key.
    LastFailed {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Whether a successful run already covers an idempotency key.
    ShouldSkip {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Fail RUNNING records left behind by interrupted processes.
    Reap {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        older_than_secs: u64,
    },
    /// Fingerprint a payload without touching any ledger.
    ///
    /// With `--directive` the payload is validated first and hashed in its
    /// typed form, which is the fingerprint the ledger keys runs by. Without
    /// it the raw JSON is hashed as given.
    Fingerprint {
        #[arg(long, value_enum)]
        directive: Option<KnownDirective>,
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        #[arg(long)]
        input_file: Option<PathBuf>,
    },
}

/// Directives shipped with this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KnownDirective {
    Echo,
    WriteNote,
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    #[arg(long)]
    pub ledger: PathBuf,
    #[arg(long, default_value_t = 5_000)]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct KeyArgs {
    #[arg(long)]
    pub directive_id: String,
    #[arg(long)]
    pub directive_version: String,
    #[arg(long)]
    pub fingerprint: String,
}

impl StoreArgs {
    fn open(&self) -> Result<SqliteRunLedger> {
        let config = LedgerConfig::new(&self.ledger).with_busy_timeout_ms(self.busy_timeout_ms);
        let ledger = SqliteRunLedger::open_with(&config)?;
        ledger.migrate()?;
        Ok(ledger)
    }
}

impl KeyArgs {
    fn key(&self) -> Result<IdempotencyKey> {
        let fingerprint = Fingerprint::from_str(&self.fingerprint)?;
        Ok(IdempotencyKey::new(
            self.directive_id.clone(),
            self.directive_version.clone(),
            fingerprint,
        ))
    }
}

/// Run one admin command, writing its JSON result to `stdout`.
///
/// # Errors
/// Returns an error when arguments are malformed, the ledger is unavailable,
/// or a requested run does not exist.
pub fn run_ledger_cli(cli: LedgerCli, stdout: &mut impl Write) -> Result<()> {
    let payload = match cli.command {
        LedgerCommand::Show { store, run_id } => {
            let run_id = RunId::from_str(&run_id)?;
            let record = store
                .open()?
                .get_run(run_id)?
                .ok_or_else(|| anyhow!("run {run_id} not found"))?;
            record_json(&record)?
        }
        LedgerCommand::List {
            store,
            directive_id,
            directive_version,
            status,
            limit,
        } => {
            let status = status
                .as_deref()
                .map(RunStatus::from_str)
                .transpose()?;
            let records = store.open()?.list_runs(&RunFilter {
                directive_id,
                directive_version,
                status,
                limit,
            })?;
            Value::Array(
                records
                    .iter()
                    .map(record_json)
                    .collect::<Result<Vec<_>>>()?,
            )
        }
        LedgerCommand::LastFailed { store, key } => {
            match store.open()?.get_last_failed_run(&key.key()?)? {
                Some(record) => record_json(&record)?,
                None => Value::Null,
            }
        }
        LedgerCommand::ShouldSkip { store, key } => {
            let key = key.key()?;
            let should_skip = store.open()?.should_skip(&key)?;
            json!({ "key": key.to_string(), "should_skip": should_skip })
        }
        LedgerCommand::Reap {
            store,
            older_than_secs,
        } => {
            let older_than = time::Duration::seconds(
                i64::try_from(older_than_secs).context("older-than-secs is too large")?,
            );
            let reaped = store.open()?.reap_stale_runs(older_than)?;
            tracing::info!(count = reaped.len(), "reap finished");
            json!({
                "reaped": reaped.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })
        }
        LedgerCommand::Fingerprint {
            directive,
            input,
            input_file,
        } => {
            let raw = read_raw_input(
                input.as_deref(),
                input_file.as_deref(),
                &mut std::io::stdin().lock(),
            )?;
            match directive {
                Some(KnownDirective::Echo) => keyed_fingerprint(&EchoDirective, &raw)?,
                Some(KnownDirective::WriteNote) => keyed_fingerprint(&WriteNoteDirective, &raw)?,
                None => json!({
                    "fingerprint": fingerprint(&raw),
                    "canonical": String::from_utf8_lossy(&canonical_bytes(&raw)),
                }),
            }
        }
    };

    writeln!(stdout, "{}", serde_json::to_string_pretty(&payload)?)
        .context("failed to write output")?;
    Ok(())
}

fn keyed_fingerprint<D: Directive>(directive: &D, raw: &Value) -> Result<Value> {
    let keyed = keyed_input(directive, raw)?;
    Ok(json!({
        "directive_id": directive.directive_id(),
        "directive_version": directive.directive_version(),
        "fingerprint": fingerprint(&keyed),
        "canonical": String::from_utf8_lossy(&canonical_bytes(&keyed)),
    }))
}

fn record_json(record: &RunRecord) -> Result<Value> {
    Ok(json!({
        "run_id": record.run_id.to_string(),
        "directive_id": record.directive_id,
        "directive_version": record.directive_version,
        "fingerprint": record.fingerprint,
        "status": record.status.as_str(),
        "retries": record.retries,
        "error_code": record.error_code,
        "exit_code": record.exit_code().map(|code| code.as_str()),
        "artifacts": record.artifacts,
        "metrics": record.metrics,
        "created_at": format_rfc3339(record.created_at)?,
        "updated_at": format_rfc3339(record.updated_at)?,
    }))
}
