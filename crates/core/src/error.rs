use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::item::Phase;

/// Machine readable classification attached to an [`LsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "ERR_CONFIGURATION_PROBLEM")]
    ConfigurationProblem,
    #[serde(rename = "ERR_TIMEOUT")]
    Timeout,
    #[serde(rename = "ERR_HEALTH_CHECK_TIMEOUT")]
    HealthCheckTimeout,
    #[serde(rename = "ERR_INTERNAL_PROBLEM")]
    InternalProblem,
    #[serde(rename = "ERR_FOR_INFO_ONLY")]
    ForInfoOnly,
}

/// Codes that fail an item immediately, without waiting for the escalation threshold.
pub const UNRECOVERABLE_CODES: &[ErrorCode] = &[ErrorCode::ConfigurationProblem, ErrorCode::Unauthorized];

impl ErrorCode {
    pub fn is_unrecoverable(self) -> bool { UNRECOVERABLE_CODES.contains(&self) }
}

pub type ErrorCodes = SmallVec<[ErrorCode; 2]>;

/// Error recorded on a deploy item status.
///
/// `last_transition_time` marks when this operation first started failing and is kept across
/// repeated failures of the same operation; `last_update_time` moves whenever the content changes.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("Op: {operation} - Reason: {reason} - Message: {message}")]
pub struct LsError {
    pub operation: String,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub codes: ErrorCodes,
    pub last_transition_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl LsError {
    pub fn new(operation: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            operation: operation.into(),
            reason: reason.into(),
            message: message.into(),
            codes: SmallVec::new(),
            last_transition_time: now,
            last_update_time: now,
        }
    }

    /// Wrap any displayable error; its text becomes the message.
    pub fn wrap(operation: impl Into<String>, reason: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(operation, reason, err.to_string())
    }

    pub fn internal(operation: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, reason, message).with_code(ErrorCode::InternalProblem)
    }

    pub fn configuration(operation: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, reason, message).with_code(ErrorCode::ConfigurationProblem)
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        if !self.codes.contains(&code) { self.codes.push(code); }
        self
    }

    pub fn with_codes(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        for c in codes { self = self.with_code(c); }
        self
    }

    pub fn has_code(&self, code: ErrorCode) -> bool { self.codes.contains(&code) }

    pub fn has_any_code(&self, codes: &[ErrorCode]) -> bool { self.codes.iter().any(|c| codes.contains(c)) }

    pub fn is_unrecoverable(&self) -> bool { self.has_any_code(UNRECOVERABLE_CODES) }

    /// Known, benign condition: only `ForInfoOnly` codes.
    pub fn is_info_only(&self) -> bool {
        !self.codes.is_empty() && self.codes.iter().all(|c| *c == ErrorCode::ForInfoOnly)
    }

    /// Merge this error with the one previously recorded.
    ///
    /// Same operation keeps the first-seen time; `last_update_time` only moves if something differs.
    pub fn updated(mut self, previous: Option<&LsError>, now: DateTime<Utc>) -> LsError {
        match previous {
            Some(prev) if prev.operation == self.operation => {
                self.last_transition_time = prev.last_transition_time;
                let unchanged = prev.reason == self.reason && prev.message == self.message && prev.codes == self.codes;
                self.last_update_time = if unchanged { prev.last_update_time } else { now };
            }
            _ => {
                self.last_transition_time = now;
                self.last_update_time = now;
            }
        }
        self
    }
}

/// Phase an item should report given the error recorded on it.
///
/// Unrecoverable codes fail immediately. Info-only errors never fail on their own.
/// Anything else fails once it has persisted longer than `threshold`.
pub fn phase_for_last_error(phase: Phase, last_error: Option<&LsError>, threshold: StdDuration, now: DateTime<Utc>) -> Phase {
    let Some(err) = last_error else { return phase };
    if err.is_unrecoverable() { return phase.failed_variant(); }
    if err.is_info_only() { return phase; }
    let elapsed = (now - err.last_transition_time).to_std().unwrap_or_default();
    if elapsed > threshold { phase.failed_variant() } else { phase }
}

/// Errors surfaced by a [`crate::ClusterStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("no match for kind: {0}")]
    NoMatch(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
    /// The object cannot exist: deleted, or its kind is no longer served.
    pub fn is_gone(&self) -> bool { matches!(self, StoreError::NotFound(_) | StoreError::NoMatch(_)) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError::new(field, message));
    }
    pub fn extend(&mut self, other: ValidationErrors) { self.0.extend(other.0); }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}
