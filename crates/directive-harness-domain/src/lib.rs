#![forbid(unsafe_code)]

mod fingerprint;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub use fingerprint::{
    canonical_bytes, canonicalize_json, fingerprint, fingerprint_of, Fingerprint, FINGERPRINT_LEN,
};

pub type DateTimeUtc = OffsetDateTime;

/// String-keyed payload attached to a run on completion.
pub type Payload = BTreeMap<String, Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("invalid run_id ULID: {0}")]
    InvalidRunId(String),
    #[error("invalid RFC3339 datetime: {0}")]
    InvalidTimestamp(String),
    #[error("unknown run status: {0}")]
    UnknownStatus(String),
    #[error("exit code {0} is outside the 0..=8 taxonomy")]
    UnknownExitCode(i64),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_str(value)
            .map(Self)
            .map_err(|err| DomainError::InvalidRunId(format!("{value}: {err}")))
    }
}

/// Lifecycle states of a run.
///
/// Only `Running`, `Success` and `Failed` are ever written to a ledger.
/// `Pending` and `Skipped` are reported to callers (a planned dry run and a
/// read-only skip decision) but never persisted as rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether a ledger may write this status into a row.
    #[must_use]
    pub fn is_persistable(self) -> bool {
        matches!(self, Self::Running | Self::Success | Self::Failed)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| DomainError::UnknownStatus(value.to_string()))
    }
}

/// Closed exit-code taxonomy consumed by orchestrators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success,
    UnknownError,
    ValidationError,
    AuthError,
    PolicyViolation,
    RateLimited,
    TransientNetwork,
    Timeout,
    DependencyError,
}

/// What an orchestrator is expected to do after seeing an [`ExitCode`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorAction {
    Proceed,
    HumanIntervention,
    FixInputs,
    RefreshCredentials,
    RequestOverride,
    RetryWithBackoffAndJitter,
    RetryImmediatelyBounded,
    RetryWithLongerTimeout,
    RebuildEnvironment,
}

impl ExitCode {
    pub const ALL: [Self; 9] = [
        Self::Success,
        Self::UnknownError,
        Self::ValidationError,
        Self::AuthError,
        Self::PolicyViolation,
        Self::RateLimited,
        Self::TransientNetwork,
        Self::Timeout,
        Self::DependencyError,
    ];

    /// Bounded retry count for [`ExitCode::TransientNetwork`].
    pub const MAX_IMMEDIATE_RETRIES: u32 = 3;

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::UnknownError => 1,
            Self::ValidationError => 2,
            Self::AuthError => 3,
            Self::PolicyViolation => 4,
            Self::RateLimited => 5,
            Self::TransientNetwork => 6,
            Self::Timeout => 7,
            Self::DependencyError => 8,
        }
    }

    /// # Errors
    /// Returns [`DomainError::UnknownExitCode`] for values outside the taxonomy.
    pub fn from_code(code: i64) -> Result<Self, DomainError> {
        Self::ALL
            .iter()
            .copied()
            .find(|candidate| i64::from(candidate.code()) == code)
            .ok_or(DomainError::UnknownExitCode(code))
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UnknownError => "unknown_error",
            Self::ValidationError => "validation_error",
            Self::AuthError => "auth_error",
            Self::PolicyViolation => "policy_violation",
            Self::RateLimited => "rate_limited",
            Self::TransientNetwork => "transient_network",
            Self::Timeout => "timeout",
            Self::DependencyError => "dependency_error",
        }
    }

    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::TransientNetwork | Self::Timeout
        )
    }

    #[must_use]
    pub fn orchestrator_action(self) -> OrchestratorAction {
        match self {
            Self::Success => OrchestratorAction::Proceed,
            Self::UnknownError => OrchestratorAction::HumanIntervention,
            Self::ValidationError => OrchestratorAction::FixInputs,
            Self::AuthError => OrchestratorAction::RefreshCredentials,
            Self::PolicyViolation => OrchestratorAction::RequestOverride,
            Self::RateLimited => OrchestratorAction::RetryWithBackoffAndJitter,
            Self::TransientNetwork => OrchestratorAction::RetryImmediatelyBounded,
            Self::Timeout => OrchestratorAction::RetryWithLongerTimeout,
            Self::DependencyError => OrchestratorAction::RebuildEnvironment,
        }
    }
}

impl Display for ExitCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.as_str())
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(value: ExitCode) -> Self {
        Self::from(value.code())
    }
}

/// `(directive_id, directive_version, fingerprint)`: identifies "this exact work".
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IdempotencyKey {
    pub directive_id: String,
    pub directive_version: String,
    pub fingerprint: Fingerprint,
}

impl IdempotencyKey {
    #[must_use]
    pub fn new(
        directive_id: impl Into<String>,
        directive_version: impl Into<String>,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            directive_id: directive_id.into(),
            directive_version: directive_version.into(),
            fingerprint,
        }
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            self.directive_id, self.directive_version, self.fingerprint
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub directive_id: String,
    pub directive_version: String,
    pub fingerprint: Fingerprint,
    pub status: RunStatus,
    pub retries: u32,
    pub error_code: Option<u8>,
    pub artifacts: Payload,
    pub metrics: Payload,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl RunRecord {
    #[must_use]
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(
            self.directive_id.clone(),
            self.directive_version.clone(),
            self.fingerprint.clone(),
        )
    }

    /// The error code interpreted against the exit-code taxonomy.
    #[must_use]
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.error_code
            .and_then(|code| ExitCode::from_code(i64::from(code)).ok())
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// # Errors
/// Returns [`DomainError::InvalidTimestamp`] if the value cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, DomainError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::InvalidTimestamp(err.to_string()))
}

/// # Errors
/// Returns [`DomainError::InvalidTimestamp`] if the value is not RFC3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc, DomainError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::InvalidTimestamp(format!("{value}: {err}")))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`DomainError::InvalidField`] naming the empty field.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::InvalidField {
            field: field_name.to_string(),
            reason: "must be non-empty".to_string(),
        });
    }
    Ok(())
}
