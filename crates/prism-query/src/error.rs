//! Error types for query optimization.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error classes shared by every Prism component.
///
/// Callers use the kind to decide whether to fix input, narrow a request, back off,
/// or report a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Malformed request or template. Fix the input and retry.
  Validation,
  /// Request exceeds complexity or row thresholds. Narrow it and retry.
  ComplexityRejection,
  /// The query backend failed.
  Execution,
  /// A workflow step failed or exceeded its deadline.
  StepFailure,
  /// No capacity to accept the work right now. Back off and retry.
  Capacity,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::Validation => "validation_error",
      ErrorKind::ComplexityRejection => "complexity_rejection",
      ErrorKind::Execution => "execution_error",
      ErrorKind::StepFailure => "step_failure",
      ErrorKind::Capacity => "capacity_error",
    };
    f.write_str(name)
  }
}

/// Which admission threshold a request exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceededLimit {
  Complexity { score: u8, max: u8 },
  EstimatedRows { estimate: u64, max: u64 },
}

impl fmt::Display for ExceededLimit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ExceededLimit::Complexity { score, max } => {
        write!(f, "complexity score {} exceeds max_complexity {}", score, max)
      }
      ExceededLimit::EstimatedRows { estimate, max } => {
        write!(
          f,
          "estimated {} rows exceeds max_estimated_rows {}",
          estimate, max
        )
      }
    }
  }
}

/// Failure reported by an external collaborator, such as the query backend.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
  pub message: String,
}

impl BackendError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// Errors that can occur while optimizing or executing a query.
#[derive(Debug, Error)]
pub enum QueryError {
  #[error("unknown model '{model}'")]
  UnknownModel { model: String },

  #[error("unknown {kind} '{field}' on model '{model}'")]
  UnknownField {
    model: String,
    kind: &'static str,
    field: String,
  },

  #[error("invalid request: {message}")]
  InvalidRequest { message: String },

  #[error("query on '{model}' rejected: {limit}")]
  ComplexityRejected {
    model: String,
    complexity: u8,
    estimated_rows: u64,
    limit: ExceededLimit,
  },

  #[error("query on '{model}' failed: {source}")]
  Execution {
    model: String,
    #[source]
    source: BackendError,
  },

  #[error("query on '{model}' timed out after {timeout:?}")]
  Timeout { model: String, timeout: Duration },

  #[error("query capacity exhausted: {message}")]
  Capacity { message: String },
}

impl QueryError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      QueryError::UnknownModel { .. }
      | QueryError::UnknownField { .. }
      | QueryError::InvalidRequest { .. } => ErrorKind::Validation,
      QueryError::ComplexityRejected { .. } => ErrorKind::ComplexityRejection,
      QueryError::Execution { .. } | QueryError::Timeout { .. } => ErrorKind::Execution,
      QueryError::Capacity { .. } => ErrorKind::Capacity,
    }
  }
}
