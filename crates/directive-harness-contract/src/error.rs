use std::io::ErrorKind;

use directive_harness_domain::ExitCode;
use directive_harness_ledger_core::LedgerError;

/// Failure raised by a unit of work, tagged with the taxonomy entry the
/// orchestrator should act on.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DirectiveError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("policy violation: {0}")]
    Policy(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("dependency unavailable: {0}")]
    Dependency(String),
    #[error("execution interrupted")]
    Interrupted,
}

impl DirectiveError {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Validation(_) => ExitCode::ValidationError,
            Self::Auth(_) => ExitCode::AuthError,
            Self::Policy(_) => ExitCode::PolicyViolation,
            Self::RateLimited(_) => ExitCode::RateLimited,
            Self::TransientNetwork(_) => ExitCode::TransientNetwork,
            Self::Timeout(_) => ExitCode::Timeout,
            Self::Dependency(_) => ExitCode::DependencyError,
            Self::Interrupted => ExitCode::UnknownError,
        }
    }
}

/// A payload that does not conform to a directive's declared shape.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ShapeError {
    #[error("input does not match the declared shape: {0}")]
    Input(String),
    /// The unit of work malfunctioned; never blamed on the caller.
    #[error("output does not match the declared shape: {0}")]
    Output(String),
}

impl ShapeError {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Input(_) => ExitCode::ValidationError,
            Self::Output(_) => ExitCode::UnknownError,
        }
    }
}

/// Map any failure onto the closed exit-code taxonomy.
///
/// The error chain is walked outermost first, so context added with
/// `anyhow::Context` does not hide a typed cause. Unrecognised failures are
/// [`ExitCode::UnknownError`].
#[must_use]
pub fn classify_error(err: &anyhow::Error) -> ExitCode {
    err.chain()
        .find_map(classify_cause)
        .unwrap_or(ExitCode::UnknownError)
}

fn classify_cause(cause: &(dyn std::error::Error + 'static)) -> Option<ExitCode> {
    if let Some(err) = cause.downcast_ref::<DirectiveError>() {
        return Some(err.exit_code());
    }
    if let Some(err) = cause.downcast_ref::<ShapeError>() {
        return Some(err.exit_code());
    }
    if let Some(err) = cause.downcast_ref::<LedgerError>() {
        return Some(classify_ledger_error(err));
    }
    if let Some(err) = cause.downcast_ref::<std::io::Error>() {
        return classify_io_error(err.kind());
    }
    if cause.downcast_ref::<serde_json::Error>().is_some() {
        return Some(ExitCode::ValidationError);
    }
    None
}

#[must_use]
pub fn classify_ledger_error(err: &LedgerError) -> ExitCode {
    if err.is_busy() {
        ExitCode::Timeout
    } else {
        ExitCode::UnknownError
    }
}

fn classify_io_error(kind: ErrorKind) -> Option<ExitCode> {
    match kind {
        ErrorKind::NotFound => Some(ExitCode::ValidationError),
        ErrorKind::PermissionDenied => Some(ExitCode::AuthError),
        ErrorKind::TimedOut => Some(ExitCode::Timeout),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted => Some(ExitCode::TransientNetwork),
        _ => None,
    }
}
