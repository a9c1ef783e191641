#![forbid(unsafe_code)]

pub mod admin;
pub mod directives;
mod input;
mod interrupt;
mod logging;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use directive_harness_contract::{
    classify_error, describe_schemas, plan_invocation, ActiveRun, ContentionPolicy,
    ContractConfig, Directive, ExecutionContract, Invocation, InvocationMode,
};
use directive_harness_domain::ExitCode;
use directive_harness_ledger_core::{LedgerError, RunLedger};
use directive_harness_ledger_sqlite::{LedgerConfig, SqliteRunLedger};
use serde_json::Value;

pub use input::read_raw_input;
pub use interrupt::install_interrupt_handler;
pub use logging::init_logging;

/// Uniform command surface shared by every directive binary.
#[derive(Debug, Clone, Parser)]
#[command(about = "Run a directive through the idempotent execution contract")]
pub struct DirectiveArgs {
    /// JSON input as a string.
    #[arg(long, conflicts_with = "input_file")]
    pub input: Option<String>,
    /// Path to a JSON input file.
    #[arg(long)]
    pub input_file: Option<PathBuf>,
    /// Print input/output JSON schemas and exit.
    #[arg(long, default_value_t = false)]
    pub schema: bool,
    /// Validate and report the planned action without executing.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    /// Run ledger database. Required to execute.
    #[arg(long)]
    pub ledger: Option<PathBuf>,
    #[arg(long, default_value_t = 5_000)]
    pub busy_timeout_ms: u64,
    /// Reap a RUNNING holder of the same key older than this.
    #[arg(long)]
    pub stale_after_secs: Option<u64>,
    /// How long to wait for an in-flight run of the same key.
    #[arg(long, default_value_t = 30_000)]
    pub wait_timeout_ms: u64,
    #[arg(long, default_value_t = 100)]
    pub poll_interval_ms: u64,
    /// Exit with RATE_LIMITED instead of waiting for an in-flight run.
    #[arg(long, default_value_t = false)]
    pub fail_fast: bool,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl DirectiveArgs {
    #[must_use]
    pub fn contract_config(&self) -> ContractConfig {
        let contention = if self.fail_fast {
            ContentionPolicy::FailFast
        } else {
            ContentionPolicy::Wait {
                timeout: Duration::from_millis(self.wait_timeout_ms),
                poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            }
        };
        ContractConfig {
            contention,
            stale_after: self
                .stale_after_secs
                .map(|secs| time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))),
        }
    }

    #[must_use]
    pub fn ledger_config(&self) -> Option<LedgerConfig> {
        self.ledger
            .as_ref()
            .map(|path| LedgerConfig::new(path).with_busy_timeout_ms(self.busy_timeout_ms))
    }
}

/// Entry point for a directive binary: parse flags, run, map to an exit code.
pub fn run_directive_cli<D: Directive>(directive: &D) -> std::process::ExitCode {
    let args = DirectiveArgs::parse();
    init_logging(&args.log_level);

    let active_run = ActiveRun::default();
    if let Err(err) = install_interrupt_handler(args.ledger_config(), active_run.clone()) {
        tracing::error!(error = %err, "failed to install interrupt handler");
        return ExitCode::UnknownError.into();
    }
    tracing::debug!("interrupt handler installed");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_directive(
        directive,
        &args,
        &active_run,
        &mut stdin.lock(),
        &mut stdout.lock(),
    )
    .into()
}

/// Run one invocation against explicit streams.
///
/// Only the success payload is written to `stdout`; diagnostics go through
/// `tracing`. A claimed run id is published to `active_run` while it executes.
pub fn run_directive<D: Directive>(
    directive: &D,
    args: &DirectiveArgs,
    active_run: &ActiveRun,
    stdin: &mut impl Read,
    stdout: &mut impl Write,
) -> ExitCode {
    let directive_id = directive.directive_id();

    if args.schema {
        return emit(stdout, &describe_schemas(directive));
    }

    if args.dry_run && !directive.has_side_effects() {
        tracing::error!(
            directive_id,
            "--dry-run is only available for directives with side effects"
        );
        return ExitCode::ValidationError;
    }

    let raw = match read_raw_input(args.input.as_deref(), args.input_file.as_deref(), stdin) {
        Ok(raw) => raw,
        Err(err) => {
            let exit_code = classify_error(&err);
            tracing::error!(
                directive_id,
                exit_code = exit_code.code(),
                error = %format!("{err:#}"),
                "failed to load input"
            );
            return exit_code;
        }
    };

    let invocation = if args.dry_run {
        plan_invocation(directive, &raw)
    } else {
        match open_ledger(args) {
            Ok(ledger) => ExecutionContract::new(directive, &ledger, args.contract_config())
                .with_active_run(active_run.clone())
                .invoke(&raw, InvocationMode::Execute),
            Err(exit_code) => return exit_code,
        }
    };

    report(stdout, directive_id, &invocation)
}

fn open_ledger(args: &DirectiveArgs) -> Result<SqliteRunLedger, ExitCode> {
    let Some(config) = args.ledger_config() else {
        tracing::error!("no run ledger configured; pass --ledger <path>");
        return Err(ExitCode::DependencyError);
    };

    let ledger =
        SqliteRunLedger::open_with(&config).map_err(|err| ledger_unavailable(&config, &err))?;
    ledger
        .migrate()
        .map_err(|err| ledger_unavailable(&config, &err))?;
    Ok(ledger)
}

fn ledger_unavailable(config: &LedgerConfig, err: &LedgerError) -> ExitCode {
    let exit_code = if err.is_busy() {
        ExitCode::Timeout
    } else {
        ExitCode::DependencyError
    };
    tracing::error!(
        ledger = %config.path.display(),
        exit_code = exit_code.code(),
        error = %err,
        "run ledger unavailable"
    );
    exit_code
}

fn report(stdout: &mut impl Write, directive_id: &str, invocation: &Invocation) -> ExitCode {
    let exit_code = invocation.exit_code();
    match invocation {
        Invocation::Failed { message, .. } => {
            tracing::error!(
                directive_id,
                exit_code = exit_code.code(),
                error = %message,
                "invocation failed"
            );
        }
        other => {
            tracing::info!(directive_id, status = %other.status(), "invocation finished");
        }
    }

    match invocation.stdout_payload() {
        Some(payload) => match emit(stdout, &payload) {
            ExitCode::Success => exit_code,
            write_failure => write_failure,
        },
        None => exit_code,
    }
}

fn emit(stdout: &mut impl Write, payload: &Value) -> ExitCode {
    let written = serde_json::to_string_pretty(payload)
        .map_err(anyhow::Error::from)
        .and_then(|body| writeln!(stdout, "{body}").map_err(anyhow::Error::from));
    match written {
        Ok(()) => ExitCode::Success,
        Err(err) => {
            tracing::error!(error = %err, "failed to write output");
            ExitCode::UnknownError
        }
    }
}
