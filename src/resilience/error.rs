use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every stage of the evaluation pipeline.
#[derive(Debug, Clone, Error)]
pub(crate) enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("circuit open for {dependency}")]
    CircuitOpen { dependency: String },
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<PipelineError> },
    #[error("task timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("persistence error: {0}")]
    Persistence(String),
    /// The job crashed before writing its own result.
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "evaluationerrorkind", rename_all = "snake_case")]
pub(crate) enum ErrorKind {
    Validation,
    NotFound,
    Transient,
    CircuitOpen,
    RetriesExhausted,
    Timeout,
    Persistence,
    Internal,
}

impl ErrorKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Internal => "internal",
        }
    }
}

impl PipelineError {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Transient(_) => ErrorKind::Transient,
            PipelineError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            PipelineError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::Persistence(_) => ErrorKind::Persistence,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only transient failures are retried and counted by circuit breakers.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }

    pub(crate) fn is_circuit_open(&self) -> bool {
        matches!(self, PipelineError::CircuitOpen { .. })
    }

    pub(crate) fn transient(err: impl std::fmt::Display) -> Self {
        PipelineError::Transient(err.to_string())
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}
