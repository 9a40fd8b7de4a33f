//! Error types for orchestration operations.
//!
//! Defines the error taxonomy shared by the run coordinator, the job
//! executor and the query job scheduler:
//! - Validation of pipeline definitions and run requests
//! - Lookup and conflict failures surfaced from storage
//! - Concurrency cap enforcement
//! - Execution failures reported by notebook runners and query engines

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::storage::StorageError;

/// Errors raised while validating pipeline definitions and run requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The job dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// A job names a dependency that does not exist in its pipeline.
    #[error("Job '{job}' depends on unknown job '{missing}'")]
    UnknownDependency { job: String, missing: String },

    /// Two jobs in the same pipeline share a name.
    #[error("Duplicate job name '{0}'")]
    DuplicateJobName(String),

    /// A run parameter name is not a valid identifier.
    #[error("Invalid parameter name '{0}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidParameterName(String),

    /// Any other malformed input.
    #[error("{0}")]
    InvalidInput(String),
}

/// Top-level error returned by the orchestration API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Pipeline {pipeline_id} has {active} active runs (limit {limit})")]
    ConcurrencyLimit {
        pipeline_id: Uuid,
        active: u64,
        limit: u32,
    },

    #[error("Invalid state transition from '{from}': {reason}")]
    InvalidTransition { from: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl OrchestratorError {
    /// Builds a `NotFound` error for the given entity kind.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns true if the error is caused by caller input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, id } => Self::NotFound { entity, id },
            StorageError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Storage(other),
        }
    }
}

/// Classification of an execution failure, used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// Worth retrying: connection resets, lock conflicts, overload.
    Transient,
    /// Deterministic failure: bad SQL, missing objects, permission denied.
    Terminal,
    /// The attempt exceeded its time budget.
    Timeout,
    /// The attempt observed a cancellation request.
    Cancelled,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Substrings that mark an otherwise untyped engine error as transient.
const RETRYABLE_HINTS: &[&str] = &[
    "timeout",
    "timed out",
    "temporarily",
    "temporary",
    "connection reset",
    "connection refused",
    "eof",
    "broken pipe",
];

/// Failure reported by a notebook runner or query engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Cancelled,
            message: message.into(),
        }
    }

    /// Classifies a free-form error message by looking for retryable hints.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if RETRYABLE_HINTS.iter().any(|hint| lower.contains(hint)) {
            Self::transient(message)
        } else {
            Self::terminal(message)
        }
    }

    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ExecutionErrorKind::Transient | ExecutionErrorKind::Timeout
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ExecutionErrorKind::Cancelled
    }
}
