#![forbid(unsafe_code)]

mod error;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use directive_harness_domain::{
    fingerprint_of, ExitCode, Fingerprint, IdempotencyKey, Payload, RunId, RunRecord, RunStatus,
};
use directive_harness_ledger_core::{ClaimOutcome, LedgerError, LedgerResult, RunLedger};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use error::{classify_error, classify_ledger_error, DirectiveError, ShapeError};

/// A named, versioned unit of work.
///
/// Implementations declare their input and output shapes as types; the
/// [`ExecutionContract`] owns validation, idempotency and outcome mapping.
pub trait Directive {
    type Input: DeserializeOwned + Serialize + JsonSchema;
    type Output: DeserializeOwned + Serialize + JsonSchema;

    fn directive_id(&self) -> &str;

    fn directive_version(&self) -> &str;

    /// Directives that mutate external state support dry runs.
    fn has_side_effects(&self) -> bool {
        false
    }

    /// Parse a raw payload into the typed input.
    ///
    /// # Errors
    /// Returns [`ShapeError::Input`] when the payload does not match `Input`.
    fn validate(&self, raw: &Value) -> Result<Self::Input, ShapeError> {
        serde_json::from_value(raw.clone()).map_err(|err| ShapeError::Input(err.to_string()))
    }

    /// Extra checks on a produced output beyond its type.
    ///
    /// # Errors
    /// Returns [`ShapeError::Output`] when the output is unacceptable.
    fn validate_output(&self, _output: &Self::Output) -> Result<(), ShapeError> {
        Ok(())
    }

    /// Intent reported by a dry run.
    fn plan(&self, input: &Self::Input) -> Value {
        json!({
            "action": "execute",
            "directive_id": self.directive_id(),
            "input": input,
        })
    }

    /// Perform the work.
    ///
    /// # Errors
    /// Any error is classified with [`classify_error`] and recorded as a failed run.
    fn execute(&self, input: Self::Input, ctx: &mut RunContext<'_>) -> anyhow::Result<Self::Output>;
}

/// What a unit of work sees while it runs.
pub struct RunContext<'a> {
    ledger: &'a dyn RunLedger,
    run_id: RunId,
    key: IdempotencyKey,
    previous_failure: Option<RunRecord>,
    artifacts: Payload,
    metrics: Payload,
    retries: u32,
}

impl<'a> RunContext<'a> {
    fn new(
        ledger: &'a dyn RunLedger,
        run_id: RunId,
        key: IdempotencyKey,
        previous_failure: Option<RunRecord>,
    ) -> Self {
        Self {
            ledger,
            run_id,
            key,
            previous_failure,
            artifacts: Payload::new(),
            metrics: Payload::new(),
            retries: 0,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.key.fingerprint
    }

    /// Most recent failed attempt for the same idempotency key, for resuming.
    #[must_use]
    pub fn previous_failure(&self) -> Option<&RunRecord> {
        self.previous_failure.as_ref()
    }

    pub fn attach_artifact(&mut self, name: impl Into<String>, value: Value) {
        self.artifacts.insert(name.into(), value);
    }

    pub fn record_metric(&mut self, name: impl Into<String>, value: Value) {
        self.metrics.insert(name.into(), value);
    }

    /// Count an internal retry against the current run.
    ///
    /// # Errors
    /// Propagates the ledger failure; the run stays `RUNNING`.
    pub fn record_retry(&mut self) -> LedgerResult<u32> {
        self.ledger
            .update_status(self.run_id, RunStatus::Running, None, true)?;
        self.retries += 1;
        Ok(self.retries)
    }

    fn into_parts(self) -> (Payload, Payload) {
        (self.artifacts, self.metrics)
    }
}

/// How a caller that finds the key held by an in-flight run behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionPolicy {
    /// Report `RATE_LIMITED` at once; the orchestrator backs off.
    FailFast,
    /// Poll until the holder finishes; `TIMEOUT` once `timeout` elapses.
    Wait {
        timeout: Duration,
        poll_interval: Duration,
    },
}

impl Default for ContentionPolicy {
    fn default() -> Self {
        Self::Wait {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractConfig {
    pub contention: ContentionPolicy,
    /// Reap a `RUNNING` holder whose last update is older than this.
    pub stale_after: Option<time::Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    Execute,
    DryRun,
}

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Invocation {
    Completed {
        run_id: RunId,
        fingerprint: Fingerprint,
        output: Value,
    },
    /// A prior success already covers this key; nothing was written.
    Skipped {
        prior_run_id: RunId,
        fingerprint: Fingerprint,
        output: Option<Value>,
    },
    Planned {
        fingerprint: Fingerprint,
        plan: Value,
    },
    Failed {
        run_id: Option<RunId>,
        fingerprint: Option<Fingerprint>,
        exit_code: ExitCode,
        message: String,
    },
}

impl Invocation {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Completed { .. } | Self::Skipped { .. } | Self::Planned { .. } => {
                ExitCode::Success
            }
            Self::Failed { exit_code, .. } => *exit_code,
        }
    }

    /// Caller-facing status; `Pending` and `Skipped` are never ledger rows.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Success,
            Self::Skipped { .. } => RunStatus::Skipped,
            Self::Planned { .. } => RunStatus::Pending,
            Self::Failed { .. } => RunStatus::Failed,
        }
    }

    /// The payload for the success channel, if any.
    #[must_use]
    pub fn stdout_payload(&self) -> Option<Value> {
        match self {
            Self::Completed { output, .. } => Some(output.clone()),
            Self::Skipped {
                prior_run_id,
                fingerprint,
                output,
            } => Some(output.clone().unwrap_or_else(|| {
                json!({
                    "skipped": true,
                    "prior_run_id": prior_run_id.to_string(),
                    "fingerprint": fingerprint,
                })
            })),
            Self::Planned { fingerprint, plan } => Some(json!({
                "dry_run": true,
                "fingerprint": fingerprint,
                "plan": plan,
            })),
            Self::Failed { .. } => None,
        }
    }
}

/// Declared shapes of a directive, as printed by `--schema`.
#[must_use]
pub fn describe_schemas<D: Directive>(directive: &D) -> Value {
    json!({
        "directive_id": directive.directive_id(),
        "directive_version": directive.directive_version(),
        "has_side_effects": directive.has_side_effects(),
        "input_schema": schema_for!(D::Input),
        "output_schema": schema_for!(D::Output),
    })
}

/// Dry run without a ledger: validate, fingerprint and report intent.
#[must_use]
pub fn plan_invocation<D: Directive>(directive: &D, raw: &Value) -> Invocation {
    match validate_and_fingerprint(directive, raw) {
        Ok((input, fingerprint)) => planned(directive, &input, fingerprint),
        Err(rejected) => rejected.into(),
    }
}

/// Validated input in the form the ledger keys runs by.
///
/// # Errors
/// Returns [`ShapeError::Input`] when `raw` does not match the declared input.
pub fn keyed_input<D: Directive>(directive: &D, raw: &Value) -> Result<Value, ShapeError> {
    let input = directive.validate(raw)?;
    serde_json::to_value(&input).map_err(|err| ShapeError::Input(err.to_string()))
}

/// Input refused before any ledger access.
struct Rejected {
    exit_code: ExitCode,
    message: String,
}

impl From<Rejected> for Invocation {
    fn from(rejected: Rejected) -> Self {
        Self::Failed {
            run_id: None,
            fingerprint: None,
            exit_code: rejected.exit_code,
            message: rejected.message,
        }
    }
}

fn validate_and_fingerprint<D: Directive>(
    directive: &D,
    raw: &Value,
) -> Result<(D::Input, Fingerprint), Rejected> {
    let directive_id = directive.directive_id();

    let input = directive.validate(raw).map_err(|err| {
        tracing::warn!(directive_id, error = %err, "input validation failed");
        Rejected {
            exit_code: err.exit_code(),
            message: err.to_string(),
        }
    })?;

    let fingerprint = fingerprint_of(&input).map_err(|err| {
        tracing::warn!(directive_id, error = %err, "input could not be fingerprinted");
        Rejected {
            exit_code: ExitCode::ValidationError,
            message: err.to_string(),
        }
    })?;

    Ok((input, fingerprint))
}

fn planned<D: Directive>(directive: &D, input: &D::Input, fingerprint: Fingerprint) -> Invocation {
    tracing::info!(
        directive_id = directive.directive_id(),
        fingerprint = %fingerprint,
        "dry run planned"
    );
    Invocation::Planned {
        plan: directive.plan(input),
        fingerprint,
    }
}

/// The run this process currently holds, shared with out-of-band observers
/// such as an interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct ActiveRun(Arc<Mutex<Option<RunId>>>);

impl ActiveRun {
    #[must_use]
    pub fn current(&self) -> Option<RunId> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, run_id: Option<RunId>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = run_id;
    }
}

enum ClaimStep {
    Run(RunId),
    Finished(Invocation),
}

/// The single choke point through which a directive is invoked.
pub struct ExecutionContract<'a, D: Directive> {
    directive: &'a D,
    ledger: &'a dyn RunLedger,
    config: ContractConfig,
    active_run: Option<ActiveRun>,
}

impl<'a, D: Directive> ExecutionContract<'a, D> {
    #[must_use]
    pub fn new(directive: &'a D, ledger: &'a dyn RunLedger, config: ContractConfig) -> Self {
        Self {
            directive,
            ledger,
            config,
            active_run: None,
        }
    }

    /// Publish the claimed run id to `active_run` while the unit of work runs.
    #[must_use]
    pub fn with_active_run(mut self, active_run: ActiveRun) -> Self {
        self.active_run = Some(active_run);
        self
    }

    /// Validate, gate on the ledger, execute, and record the outcome.
    ///
    /// Never panics on directive or ledger failure; every failure is reported
    /// as [`Invocation::Failed`] with a taxonomy code.
    #[must_use]
    pub fn invoke(&self, raw: &Value, mode: InvocationMode) -> Invocation {
        let (input, fingerprint) = match validate_and_fingerprint(self.directive, raw) {
            Ok(validated) => validated,
            Err(rejected) => return rejected.into(),
        };

        if mode == InvocationMode::DryRun {
            return planned(self.directive, &input, fingerprint);
        }

        let key = IdempotencyKey::new(
            self.directive.directive_id(),
            self.directive.directive_version(),
            fingerprint,
        );
        match self.claim(&key) {
            ClaimStep::Run(run_id) => {
                self.publish(Some(run_id));
                let invocation = self.run_claimed(run_id, key, input);
                self.publish(None);
                invocation
            }
            ClaimStep::Finished(invocation) => invocation,
        }
    }

    fn publish(&self, run_id: Option<RunId>) {
        if let Some(active_run) = &self.active_run {
            active_run.set(run_id);
        }
    }

    fn claim(&self, key: &IdempotencyKey) -> ClaimStep {
        let started = Instant::now();
        loop {
            let outcome = match self.ledger.claim_run(key, self.config.stale_after) {
                Ok(outcome) => outcome,
                Err(err) => return ClaimStep::Finished(ledger_failure(None, key, &err)),
            };

            let holder = match outcome {
                ClaimOutcome::Claimed(run_id) => {
                    tracing::info!(key = %key, run_id = %run_id, "run started");
                    return ClaimStep::Run(run_id);
                }
                ClaimOutcome::AlreadySucceeded(record) => {
                    tracing::info!(
                        key = %key,
                        prior_run_id = %record.run_id,
                        "skipping completed work"
                    );
                    return ClaimStep::Finished(Invocation::Skipped {
                        prior_run_id: record.run_id,
                        fingerprint: key.fingerprint.clone(),
                        output: record.artifacts.get("output").cloned(),
                    });
                }
                ClaimOutcome::InFlight(record) => record,
            };

            match self.config.contention {
                ContentionPolicy::FailFast => {
                    tracing::warn!(
                        key = %key,
                        holder = %holder.run_id,
                        "key held by in-flight run"
                    );
                    return ClaimStep::Finished(Invocation::Failed {
                        run_id: None,
                        fingerprint: Some(key.fingerprint.clone()),
                        exit_code: ExitCode::RateLimited,
                        message: format!("{key} is held by in-flight run {}", holder.run_id),
                    });
                }
                ContentionPolicy::Wait {
                    timeout,
                    poll_interval,
                } => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        tracing::warn!(
                            key = %key,
                            holder = %holder.run_id,
                            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                            "gave up waiting for in-flight run"
                        );
                        return ClaimStep::Finished(Invocation::Failed {
                            run_id: None,
                            fingerprint: Some(key.fingerprint.clone()),
                            exit_code: ExitCode::Timeout,
                            message: format!(
                                "{key} still held by run {} after {}ms",
                                holder.run_id,
                                waited.as_millis()
                            ),
                        });
                    }
                    tracing::debug!(
                        key = %key,
                        holder = %holder.run_id,
                        "waiting for in-flight run"
                    );
                    std::thread::sleep(poll_interval.min(timeout - waited));
                }
            }
        }
    }

    fn run_claimed(&self, run_id: RunId, key: IdempotencyKey, input: D::Input) -> Invocation {
        let started = Instant::now();

        let previous_failure = match self.ledger.get_last_failed_run(&key) {
            Ok(record) => record,
            Err(err) => {
                let failure = anyhow::Error::new(err);
                return self.abort(run_id, &key, &failure, Payload::new());
            }
        };
        if let Some(previous) = &previous_failure {
            tracing::info!(
                run_id = %run_id,
                previous_run_id = %previous.run_id,
                previous_error_code = previous.error_code,
                "resuming after failed attempt"
            );
        }

        let mut ctx = RunContext::new(self.ledger, run_id, key.clone(), previous_failure);
        let result = self.directive.execute(input, &mut ctx);
        let (mut artifacts, mut metrics) = ctx.into_parts();
        metrics.insert(
            "duration_ms".to_string(),
            json!(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
        );

        let output = match result.and_then(|output| self.check_output(&output)) {
            Ok(output) => output,
            Err(err) => {
                metrics.insert("error".to_string(), json!(format!("{err:#}")));
                return self.abort(run_id, &key, &err, metrics);
            }
        };

        artifacts.insert("output".to_string(), output.clone());
        if let Err(err) = self
            .ledger
            .complete_run(run_id, Some(&artifacts), Some(&metrics))
        {
            return ledger_failure(Some(run_id), &key, &err);
        }

        tracing::info!(key = %key, run_id = %run_id, "run completed");
        Invocation::Completed {
            run_id,
            fingerprint: key.fingerprint,
            output,
        }
    }

    /// Round-trip the output through its declared shape.
    fn check_output(&self, output: &D::Output) -> anyhow::Result<Value> {
        let value = serde_json::to_value(output)
            .map_err(|err| ShapeError::Output(format!("output is not representable: {err}")))?;
        let reparsed: D::Output = serde_json::from_value(value.clone())
            .map_err(|err| ShapeError::Output(err.to_string()))?;
        self.directive.validate_output(&reparsed)?;
        Ok(value)
    }

    fn abort(
        &self,
        run_id: RunId,
        key: &IdempotencyKey,
        err: &anyhow::Error,
        metrics: Payload,
    ) -> Invocation {
        let exit_code = classify_error(err);
        tracing::error!(
            key = %key,
            run_id = %run_id,
            exit_code = exit_code.code(),
            error = %format!("{err:#}"),
            "run failed"
        );
        if let Err(record_err) = self.ledger.fail_run(run_id, exit_code.code(), Some(&metrics)) {
            // The row stays RUNNING, so the ledger failure decides the code.
            let exit_code = classify_ledger_error(&record_err);
            tracing::error!(
                run_id = %run_id,
                exit_code = exit_code.code(),
                error = %record_err,
                "failed to record run failure"
            );
            return Invocation::Failed {
                run_id: Some(run_id),
                fingerprint: Some(key.fingerprint.clone()),
                exit_code,
                message: format!("{err:#}; failure not recorded: {record_err}"),
            };
        }
        Invocation::Failed {
            run_id: Some(run_id),
            fingerprint: Some(key.fingerprint.clone()),
            exit_code,
            message: format!("{err:#}"),
        }
    }
}

fn ledger_failure(run_id: Option<RunId>, key: &IdempotencyKey, err: &LedgerError) -> Invocation {
    let exit_code = classify_ledger_error(err);
    tracing::error!(key = %key, exit_code = exit_code.code(), error = %err, "ledger unavailable");
    Invocation::Failed {
        run_id,
        fingerprint: Some(key.fingerprint.clone()),
        exit_code,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directive_harness_domain::fingerprint;
    use directive_harness_ledger_core::RunFilter;
    use directive_harness_ledger_sqlite::SqliteRunLedger;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Deserialize, Serialize, JsonSchema)]
    struct QueryInput {
        query: String,
    }

    #[derive(Debug, Deserialize, Serialize, JsonSchema)]
    struct QueryOutput {
        echoed: String,
    }

    /// Echo that counts executions and can fail its first attempts.
    #[derive(Default)]
    struct CountingEcho {
        executions: Arc<AtomicUsize>,
        rate_limited_attempts: usize,
        hold_for: Option<Duration>,
        retries_per_run: u32,
        reject_output: bool,
    }

    impl Directive for CountingEcho {
        type Input = QueryInput;
        type Output = QueryOutput;

        fn directive_id(&self) -> &str {
            "echo"
        }

        fn directive_version(&self) -> &str {
            "1.0.0"
        }

        fn validate_output(&self, output: &QueryOutput) -> Result<(), ShapeError> {
            if self.reject_output {
                return Err(ShapeError::Output(format!("rejected {}", output.echoed)));
            }
            Ok(())
        }

        fn execute(
            &self,
            input: QueryInput,
            ctx: &mut RunContext<'_>,
        ) -> anyhow::Result<QueryOutput> {
            let attempt = self.executions.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = self.hold_for {
                std::thread::sleep(hold);
            }
            for _ in 0..self.retries_per_run {
                ctx.record_retry()?;
            }
            ctx.record_metric("attempt", json!(attempt));
            if let Some(previous) = ctx.previous_failure() {
                ctx.attach_artifact("resumed_from", json!(previous.run_id.to_string()));
            }
            if attempt < self.rate_limited_attempts {
                return Err(DirectiveError::RateLimited("upstream returned 429".into()).into());
            }
            Ok(QueryOutput {
                echoed: input.query,
            })
        }
    }

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn memory_ledger() -> SqliteRunLedger {
        let ledger = must(SqliteRunLedger::open(Path::new(":memory:")));
        must(ledger.migrate());
        ledger
    }

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "dh-contract-test-{name}-{}.sqlite3",
            ulid::Ulid::new()
        ))
    }

    fn fail_fast() -> ContractConfig {
        ContractConfig {
            contention: ContentionPolicy::FailFast,
            stale_after: None,
        }
    }

    fn echo_key(raw: &Value) -> IdempotencyKey {
        IdempotencyKey::new("echo", "1.0.0", fingerprint(raw))
    }

    #[test]
    fn second_identical_invocation_skips_the_unit_of_work() {
        let ledger = memory_ledger();
        let directive = CountingEcho::default();
        let contract = ExecutionContract::new(&directive, &ledger, ContractConfig::default());
        let raw = json!({"query": "hello"});

        let first = contract.invoke(&raw, InvocationMode::Execute);
        let Invocation::Completed {
            run_id, fingerprint, ..
        } = &first
        else {
            panic!("expected completion, got {first:?}");
        };
        assert_eq!(first.exit_code(), ExitCode::Success);
        assert_eq!(first.stdout_payload(), Some(json!({"echoed": "hello"})));
        assert!(must(ledger.should_skip(&echo_key(&raw))));

        let second = contract.invoke(&raw, InvocationMode::Execute);
        assert_eq!(
            second,
            Invocation::Skipped {
                prior_run_id: *run_id,
                fingerprint: fingerprint.clone(),
                output: Some(json!({"echoed": "hello"})),
            }
        );
        assert_eq!(second.status(), RunStatus::Skipped);
        assert_eq!(second.exit_code(), ExitCode::Success);
        assert_eq!(directive.executions.load(Ordering::SeqCst), 1);
        assert_eq!(must(ledger.list_runs(&RunFilter::default())).len(), 1);

        let record = match must(ledger.get_run(*run_id)) {
            Some(record) => record,
            None => panic!("completed run must be stored"),
        };
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.artifacts.get("output"), Some(&json!({"echoed": "hello"})));
        assert!(record.metrics.contains_key("duration_ms"));
    }

    #[test]
    fn key_order_is_irrelevant_to_idempotency() {
        #[derive(Debug, Deserialize, Serialize, JsonSchema)]
        struct Point {
            x: i64,
            y: i64,
        }

        struct Plot {
            executions: AtomicUsize,
        }

        impl Directive for Plot {
            type Input = Value;
            type Output = Point;

            fn directive_id(&self) -> &str {
                "plot"
            }

            fn directive_version(&self) -> &str {
                "1.0.0"
            }

            fn execute(&self, input: Value, _ctx: &mut RunContext<'_>) -> anyhow::Result<Point> {
                self.executions.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::from_value(input)?)
            }
        }

        let ledger = memory_ledger();
        let directive = Plot {
            executions: AtomicUsize::new(0),
        };
        let contract = ExecutionContract::new(&directive, &ledger, ContractConfig::default());

        let lhs: Value = must(serde_json::from_str(r#"{"x": 1, "y": 2}"#));
        let rhs: Value = must(serde_json::from_str(r#"{"y": 2, "x": 1}"#));
        let first = contract.invoke(&lhs, InvocationMode::Execute);
        let second = contract.invoke(&rhs, InvocationMode::Execute);

        assert!(matches!(first, Invocation::Completed { .. }));
        assert!(matches!(second, Invocation::Skipped { .. }));
        assert_eq!(directive.executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rate_limited_run_is_recorded_and_retried_under_a_new_run_id() {
        let ledger = memory_ledger();
        let directive = CountingEcho {
            rate_limited_attempts: 1,
            ..CountingEcho::default()
        };
        let contract = ExecutionContract::new(&directive, &ledger, ContractConfig::default());
        let raw = json!({"query": "retry me"});

        let first = contract.invoke(&raw, InvocationMode::Execute);
        assert_eq!(first.exit_code(), ExitCode::RateLimited);
        let Invocation::Failed {
            run_id: Some(failed_run),
            ..
        } = first
        else {
            panic!("expected recorded failure, got {first:?}");
        };
        let failed = match must(ledger.get_run(failed_run)) {
            Some(record) => record,
            None => panic!("failed run must be stored"),
        };
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_code, Some(5));
        assert!(failed.metrics.contains_key("error"));
        assert!(!must(ledger.should_skip(&echo_key(&raw))));

        let second = contract.invoke(&raw, InvocationMode::Execute);
        let Invocation::Completed { run_id, .. } = second else {
            panic!("retry must execute, got {second:?}");
        };
        assert_ne!(run_id, failed_run);
        let record = match must(ledger.get_run(run_id)) {
            Some(record) => record,
            None => panic!("retried run must be stored"),
        };
        assert_eq!(
            record.artifacts.get("resumed_from"),
            Some(&json!(failed_run.to_string()))
        );
        assert_eq!(directive.executions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_input_fails_before_touching_the_ledger() {
        let ledger = memory_ledger();
        let directive = CountingEcho::default();
        let contract = ExecutionContract::new(&directive, &ledger, ContractConfig::default());

        for raw in [json!({"query": 123}), json!("hello"), json!({})] {
            let outcome = contract.invoke(&raw, InvocationMode::Execute);
            assert_eq!(outcome.exit_code(), ExitCode::ValidationError);
            assert!(matches!(
                outcome,
                Invocation::Failed {
                    run_id: None,
                    fingerprint: None,
                    ..
                }
            ));
        }
        assert_eq!(directive.executions.load(Ordering::SeqCst), 0);
        assert!(must(ledger.list_runs(&RunFilter::default())).is_empty());
    }

    #[test]
    fn dry_run_reports_intent_without_writing() {
        let ledger = memory_ledger();
        let directive = CountingEcho::default();
        let contract = ExecutionContract::new(&directive, &ledger, ContractConfig::default());
        let raw = json!({"query": "plan only"});

        let outcome = contract.invoke(&raw, InvocationMode::DryRun);
        assert_eq!(
            outcome,
            Invocation::Planned {
                fingerprint: fingerprint(&raw),
                plan: json!({
                    "action": "execute",
                    "directive_id": "echo",
                    "input": {"query": "plan only"},
                }),
            }
        );
        assert_eq!(plan_invocation(&directive, &raw), outcome);
        assert_eq!(outcome.status(), RunStatus::Pending);
        assert_eq!(outcome.exit_code(), ExitCode::Success);
        assert_eq!(directive.executions.load(Ordering::SeqCst), 0);
        assert!(must(ledger.list_runs(&RunFilter::default())).is_empty());
    }

    #[test]
    fn rejected_output_is_an_unknown_error_not_a_validation_error() {
        let ledger = memory_ledger();
        let directive = CountingEcho {
            reject_output: true,
            ..CountingEcho::default()
        };
        let contract = ExecutionContract::new(&directive, &ledger, ContractConfig::default());

        let outcome = contract.invoke(&json!({"query": "bad"}), InvocationMode::Execute);
        assert_eq!(outcome.exit_code(), ExitCode::UnknownError);
        let Invocation::Failed {
            run_id: Some(run_id),
            ..
        } = outcome
        else {
            panic!("expected recorded failure, got {outcome:?}");
        };
        let record = match must(ledger.get_run(run_id)) {
            Some(record) => record,
            None => panic!("failed run must be stored"),
        };
        assert_eq!(record.error_code, Some(1));
        assert!(!record.artifacts.contains_key("output"));
    }

    #[test]
    fn retries_recorded_by_the_unit_of_work_land_on_the_run() {
        let ledger = memory_ledger();
        let directive = CountingEcho {
            retries_per_run: 3,
            ..CountingEcho::default()
        };
        let contract = ExecutionContract::new(&directive, &ledger, ContractConfig::default());

        let outcome = contract.invoke(&json!({"query": "flaky"}), InvocationMode::Execute);
        let Invocation::Completed { run_id, .. } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        let record = match must(ledger.get_run(run_id)) {
            Some(record) => record,
            None => panic!("completed run must be stored"),
        };
        assert_eq!(record.retries, 3);
        assert_eq!(record.status, RunStatus::Success);
    }

    #[test]
    fn in_flight_holder_fails_fast_or_times_out() {
        let ledger = memory_ledger();
        let directive = CountingEcho::default();
        let raw = json!({"query": "held"});
        let ClaimOutcome::Claimed(holder) = must(ledger.claim_run(&echo_key(&raw), None)) else {
            panic!("fixture claim must win");
        };

        let fast = ExecutionContract::new(&directive, &ledger, fail_fast())
            .invoke(&raw, InvocationMode::Execute);
        assert_eq!(fast.exit_code(), ExitCode::RateLimited);

        let waiting = ExecutionContract::new(
            &directive,
            &ledger,
            ContractConfig {
                contention: ContentionPolicy::Wait {
                    timeout: Duration::from_millis(60),
                    poll_interval: Duration::from_millis(10),
                },
                stale_after: None,
            },
        )
        .invoke(&raw, InvocationMode::Execute);
        assert_eq!(waiting.exit_code(), ExitCode::Timeout);
        assert_eq!(directive.executions.load(Ordering::SeqCst), 0);

        let holder_record = match must(ledger.get_run(holder)) {
            Some(record) => record,
            None => panic!("holder must still exist"),
        };
        assert_eq!(holder_record.status, RunStatus::Running);
    }

    #[test]
    fn stale_holder_is_reaped_and_the_run_resumes() {
        let ledger = memory_ledger();
        let directive = CountingEcho::default();
        let raw = json!({"query": "crashed"});
        let ClaimOutcome::Claimed(dangling) = must(ledger.claim_run(&echo_key(&raw), None)) else {
            panic!("fixture claim must win");
        };
        std::thread::sleep(Duration::from_millis(5));

        let contract = ExecutionContract::new(
            &directive,
            &ledger,
            ContractConfig {
                contention: ContentionPolicy::FailFast,
                stale_after: Some(time::Duration::ZERO),
            },
        );
        let outcome = contract.invoke(&raw, InvocationMode::Execute);
        let Invocation::Completed { run_id, .. } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        let record = match must(ledger.get_run(run_id)) {
            Some(record) => record,
            None => panic!("completed run must be stored"),
        };
        assert_eq!(
            record.artifacts.get("resumed_from"),
            Some(&json!(dangling.to_string()))
        );
    }

    #[test]
    fn concurrent_invocations_execute_the_unit_exactly_once() {
        let path = temp_db_path("race");
        let setup = must(SqliteRunLedger::open(&path));
        must(setup.migrate());
        drop(setup);

        let executions = Arc::new(AtomicUsize::new(0));
        let contenders = 6;
        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let path = path.clone();
                let executions = Arc::clone(&executions);
                std::thread::spawn(move || -> Result<Invocation, LedgerError> {
                    let ledger = SqliteRunLedger::open(&path)?;
                    let directive = CountingEcho {
                        executions,
                        hold_for: Some(Duration::from_millis(50)),
                        ..CountingEcho::default()
                    };
                    let config = ContractConfig {
                        contention: ContentionPolicy::Wait {
                            timeout: Duration::from_secs(20),
                            poll_interval: Duration::from_millis(10),
                        },
                        stale_after: None,
                    };
                    Ok(ExecutionContract::new(&directive, &ledger, config)
                        .invoke(&json!({"query": "race"}), InvocationMode::Execute))
                })
            })
            .collect();

        let mut completed = 0;
        let mut skipped = 0;
        for handle in handles {
            let outcome = match handle.join() {
                Ok(result) => must(result),
                Err(err) => panic!("contender panicked: {err:?}"),
            };
            match outcome {
                Invocation::Completed { .. } => completed += 1,
                Invocation::Skipped { .. } => skipped += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(completed, 1);
        assert_eq!(skipped, contenders - 1);

        let ledger = must(SqliteRunLedger::open(&path));
        assert_eq!(must(ledger.list_runs(&RunFilter::default())).len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    /// Delegates to SQLite but cannot record failures.
    struct UnrecordableFailures {
        inner: SqliteRunLedger,
        fail_error: LedgerError,
    }

    impl RunLedger for UnrecordableFailures {
        fn migrate(&self) -> LedgerResult<()> {
            self.inner.migrate()
        }

        fn should_skip(&self, key: &IdempotencyKey) -> LedgerResult<bool> {
            self.inner.should_skip(key)
        }

        fn get_last_failed_run(&self, key: &IdempotencyKey) -> LedgerResult<Option<RunRecord>> {
            self.inner.get_last_failed_run(key)
        }

        fn create_run(&self, key: &IdempotencyKey) -> LedgerResult<RunId> {
            self.inner.create_run(key)
        }

        fn claim_run(
            &self,
            key: &IdempotencyKey,
            stale_after: Option<time::Duration>,
        ) -> LedgerResult<ClaimOutcome> {
            self.inner.claim_run(key, stale_after)
        }

        fn update_status(
            &self,
            run_id: RunId,
            status: RunStatus,
            error_code: Option<u8>,
            increment_retries: bool,
        ) -> LedgerResult<()> {
            self.inner.update_status(run_id, status, error_code, increment_retries)
        }

        fn complete_run(
            &self,
            run_id: RunId,
            artifacts: Option<&Payload>,
            metrics: Option<&Payload>,
        ) -> LedgerResult<()> {
            self.inner.complete_run(run_id, artifacts, metrics)
        }

        fn fail_run(
            &self,
            _run_id: RunId,
            _error_code: u8,
            _metrics: Option<&Payload>,
        ) -> LedgerResult<()> {
            Err(self.fail_error.clone())
        }

        fn get_run(&self, run_id: RunId) -> LedgerResult<Option<RunRecord>> {
            self.inner.get_run(run_id)
        }

        fn list_runs(&self, filter: &RunFilter) -> LedgerResult<Vec<RunRecord>> {
            self.inner.list_runs(filter)
        }

        fn reap_stale_runs(&self, older_than: time::Duration) -> LedgerResult<Vec<RunId>> {
            self.inner.reap_stale_runs(older_than)
        }
    }

    #[test]
    fn unrecorded_failure_reports_the_ledger_error_instead_of_the_work_error() {
        let directive = CountingEcho {
            rate_limited_attempts: usize::MAX,
            ..CountingEcho::default()
        };
        let raw = json!({"query": "lost"});

        for (fail_error, expected) in [
            (LedgerError::Busy("database is locked".into()), ExitCode::Timeout),
            (LedgerError::Storage("disk I/O error".into()), ExitCode::UnknownError),
        ] {
            let ledger = UnrecordableFailures {
                inner: memory_ledger(),
                fail_error,
            };
            let outcome = ExecutionContract::new(&directive, &ledger, fail_fast())
                .invoke(&raw, InvocationMode::Execute);

            let Invocation::Failed {
                run_id: Some(run_id),
                exit_code,
                message,
                ..
            } = outcome
            else {
                panic!("expected failure, got {outcome:?}");
            };
            assert_eq!(exit_code, expected);
            assert_ne!(exit_code, ExitCode::RateLimited);
            assert!(message.contains("rate limited"), "{message}");
            assert!(message.contains("failure not recorded"), "{message}");

            let record = match must(ledger.get_run(run_id)) {
                Some(record) => record,
                None => panic!("claimed run must exist"),
            };
            assert_eq!(record.status, RunStatus::Running);
        }
    }

    #[test]
    fn active_run_is_published_only_while_the_unit_runs() {
        struct Observer {
            active_run: ActiveRun,
            seen: Mutex<Option<RunId>>,
        }

        impl Directive for Observer {
            type Input = QueryInput;
            type Output = QueryOutput;

            fn directive_id(&self) -> &str {
                "observer"
            }

            fn directive_version(&self) -> &str {
                "1.0.0"
            }

            fn execute(
                &self,
                input: QueryInput,
                _ctx: &mut RunContext<'_>,
            ) -> anyhow::Result<QueryOutput> {
                *self.seen.lock().unwrap_or_else(PoisonError::into_inner) =
                    self.active_run.current();
                Ok(QueryOutput {
                    echoed: input.query,
                })
            }
        }

        let ledger = memory_ledger();
        let active_run = ActiveRun::default();
        let directive = Observer {
            active_run: active_run.clone(),
            seen: Mutex::new(None),
        };
        let outcome = ExecutionContract::new(&directive, &ledger, ContractConfig::default())
            .with_active_run(active_run.clone())
            .invoke(&json!({"query": "watched"}), InvocationMode::Execute);

        let Invocation::Completed { run_id, .. } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(
            *directive.seen.lock().unwrap_or_else(PoisonError::into_inner),
            Some(run_id)
        );
        assert_eq!(active_run.current(), None);
    }

    #[test]
    fn schemas_describe_both_shapes() {
        let schemas = describe_schemas(&CountingEcho::default());
        assert_eq!(schemas["directive_id"], json!("echo"));
        assert_eq!(schemas["has_side_effects"], json!(false));
        assert_eq!(
            schemas["input_schema"]["properties"]["query"]["type"],
            json!("string")
        );
        assert_eq!(
            schemas["output_schema"]["required"],
            json!(["echoed"])
        );
    }
}
