//! Error taxonomy for the engine.
//!
//! Only [`ConfigError`] is fatal, and only at startup. Everything else
//! degrades to logging plus partial processing:
//!
//! - [`ValidationError`] - malformed record, skipped, batch continues
//! - [`ConflictError`] - optimistic retries exhausted on one identity key
//! - [`TriggerEvaluationError`] - isolated to a single rule for one cycle
//! - [`ActionFailure`] - retried with backoff, then reported to monitoring
//!
//! Merge conflicts between sources are NOT errors. They are recorded as
//! [`crate::types::ConflictDescriptor`]s and the upsert still succeeds.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::DiscoveryFailure;
use crate::dispatch::FailureKind;
use crate::types::{Field, IdentityKey};

/// A raw record that cannot be turned into a canonical candidate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no field mapping registered for source '{0}'")]
    UnknownSource(String),

    #[error("source '{source_id}' has no mapping version {version}")]
    UnknownMappingVersion { source_id: String, version: u32 },

    #[error("missing required field '{0}'")]
    MissingField(Field),

    #[error("field '{field}' has an invalid value: {reason}")]
    InvalidValue { field: Field, reason: String },

    #[error("invalid pagination cursor")]
    InvalidCursor,
}

/// Raised when optimistic concurrency cannot settle an upsert.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConflictError {
    #[error("concurrent updates to '{key}' did not settle after {attempts} attempts")]
    ConcurrencyExhausted { key: IdentityKey, attempts: u32 },
}

/// Errors returned by the master index.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("program '{0}' not found")]
    NotFound(IdentityKey),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

/// Error returned by a rule predicate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredicateError {
    #[error("invalid predicate parameter: {0}")]
    InvalidParameter(String),

    #[error("metric unavailable: {0}")]
    MetricUnavailable(String),

    #[error("predicate panicked: {0}")]
    Panicked(String),
}

/// A predicate failure, scoped to the rule that produced it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rule '{rule_id}' failed to evaluate: {source}")]
pub struct TriggerEvaluationError {
    pub rule_id: String,
    #[source]
    pub source: PredicateError,
}

/// Why a single action attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionFailure {
    #[error(transparent)]
    Discovery(#[from] DiscoveryFailure),

    #[error("rate limited on '{0}'")]
    RateLimited(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("action queue is full")]
    QueueFull,

    #[error("dispatcher is shut down")]
    Closed,
}

impl ActionFailure {
    /// Whether another attempt could succeed.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ActionFailure::Discovery(failure) => failure.kind,
            ActionFailure::RateLimited(_) | ActionFailure::TimedOut(_) => FailureKind::Retryable,
            ActionFailure::QueueFull | ActionFailure::Closed => FailureKind::NonRetryable,
        }
    }
}

/// Startup configuration problems. These abort engine construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },

    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("mapping '{source_id}' v{version} cannot derive an identity key: no rule maps '{field}'")]
    MissingIdentityField {
        source_id: String,
        version: u32,
        field: Field,
    },

    #[error("mapping '{source_id}' v{version} maps '{field}' from more than one raw key")]
    AmbiguousField {
        source_id: String,
        version: u32,
        field: Field,
    },

    #[error("mapping '{source_id}' v{version} is registered twice")]
    DuplicateMapping { source_id: String, version: u32 },

    #[error("trigger rule '{0}' is registered twice")]
    DuplicateRule(String),

    #[error("trigger rule '{rule_id}' is invalid: {reason}")]
    InvalidRule { rule_id: String, reason: String },
}

/// Top-level error for engine construction and wiring.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}
