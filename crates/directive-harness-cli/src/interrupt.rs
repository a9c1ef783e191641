//! SIGINT/SIGTERM handling for directive binaries.

use directive_harness_contract::{classify_ledger_error, ActiveRun, DirectiveError};
use directive_harness_domain::{ExitCode, Payload};
use directive_harness_ledger_core::{LedgerError, RunLedger};
use directive_harness_ledger_sqlite::{LedgerConfig, SqliteRunLedger};
use serde_json::json;

/// Spawn a thread that turns the first SIGINT or SIGTERM into a recorded
/// failure and a taxonomy exit code.
///
/// # Errors
/// Returns an error when the handlers cannot be registered.
#[cfg(unix)]
pub fn install_interrupt_handler(
    ledger: Option<LedgerConfig>,
    active_run: ActiveRun,
) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("dh-interrupt".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                let exit_code = record_interruption(signal, ledger.as_ref(), &active_run);
                std::process::exit(i32::from(exit_code.code()));
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps, clippy::needless_pass_by_value)]
pub fn install_interrupt_handler(
    _ledger: Option<LedgerConfig>,
    _active_run: ActiveRun,
) -> std::io::Result<()> {
    Ok(())
}

/// Fail the run held by this process, if any, and pick the exit code.
///
/// Uses its own connection; the main thread may be mid-transaction.
#[cfg_attr(not(unix), allow(dead_code))]
pub(crate) fn record_interruption(
    signal: i32,
    ledger: Option<&LedgerConfig>,
    active_run: &ActiveRun,
) -> ExitCode {
    let interrupted = DirectiveError::Interrupted;
    let exit_code = interrupted.exit_code();
    let run_id = active_run.current();
    tracing::error!(
        signal,
        holds_run = run_id.is_some(),
        exit_code = exit_code.code(),
        error = %interrupted,
        "interrupted"
    );

    let (Some(run_id), Some(config)) = (run_id, ledger) else {
        return exit_code;
    };

    let mut metrics = Payload::new();
    metrics.insert("interrupted".to_string(), json!(true));
    metrics.insert("signal".to_string(), json!(signal));
    let recorded = SqliteRunLedger::open_with(config)
        .and_then(|ledger| ledger.fail_run(run_id, exit_code.code(), Some(&metrics)));

    match recorded {
        Ok(()) => {
            tracing::info!(run_id = %run_id, "interrupted run recorded as failed");
            exit_code
        }
        // The unit of work finished first; its outcome stands.
        Err(LedgerError::TerminalState { .. }) => exit_code,
        Err(err) => {
            let exit_code = classify_ledger_error(&err);
            tracing::error!(
                run_id = %run_id,
                exit_code = exit_code.code(),
                error = %err,
                "failed to record interrupted run"
            );
            exit_code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directive_harness_contract::{
        ContractConfig, Directive, ExecutionContract, Invocation, InvocationMode, RunContext,
    };
    use directive_harness_domain::RunStatus;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    const SIGINT: i32 = 2;

    #[derive(Debug, Deserialize, Serialize, JsonSchema)]
    struct Tick {
        n: u32,
    }

    /// Simulates the signal thread firing while the unit of work runs.
    struct InterruptedMidway {
        config: LedgerConfig,
        active_run: ActiveRun,
    }

    impl Directive for InterruptedMidway {
        type Input = Tick;
        type Output = Tick;

        fn directive_id(&self) -> &str {
            "interrupted-midway"
        }

        fn directive_version(&self) -> &str {
            "1.0.0"
        }

        fn execute(&self, input: Tick, _ctx: &mut RunContext<'_>) -> anyhow::Result<Tick> {
            let exit_code = record_interruption(SIGINT, Some(&self.config), &self.active_run);
            assert_eq!(exit_code, ExitCode::UnknownError);
            Ok(input)
        }
    }

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dh-interrupt-test-{name}-{}.sqlite3", ulid::Ulid::new()))
    }

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn interruption_without_a_held_run_maps_to_unknown_error() {
        let exit_code = record_interruption(SIGINT, None, &ActiveRun::default());
        assert_eq!(exit_code, ExitCode::UnknownError);
    }

    #[test]
    fn interruption_during_a_run_records_it_as_failed() {
        let path = temp_db_path("midway");
        let config = LedgerConfig::new(&path);
        let ledger = must(SqliteRunLedger::open_with(&config));
        must(ledger.migrate());

        let active_run = ActiveRun::default();
        let directive = InterruptedMidway {
            config: config.clone(),
            active_run: active_run.clone(),
        };
        let outcome = ExecutionContract::new(&directive, &ledger, ContractConfig::default())
            .with_active_run(active_run)
            .invoke(&json!({"n": 1}), InvocationMode::Execute);

        let Invocation::Failed {
            run_id: Some(run_id),
            exit_code,
            ..
        } = outcome
        else {
            panic!("interrupted run must not complete, got {outcome:?}");
        };
        assert_eq!(exit_code, ExitCode::UnknownError);

        let record = match must(ledger.get_run(run_id)) {
            Some(record) => record,
            None => panic!("interrupted run must be stored"),
        };
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error_code, Some(1));
        assert_eq!(record.metrics.get("interrupted"), Some(&json!(true)));
        assert_eq!(record.metrics.get("signal"), Some(&json!(SIGINT)));
        let _ = std::fs::remove_file(&path);
    }
}
