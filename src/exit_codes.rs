//! Structured exit codes for machine-readable error handling.
//!
//! Scripts driving `prism` can tell rejected queries from broken backends
//! and failed workflows without parsing stderr.

use prism_query::ErrorKind;

/// Success (standard convention)
pub const SUCCESS: i32 = 0;

/// General error (fallback for unknown errors)
pub const GENERAL_ERROR: i32 = 1;

/// CLI usage error (invalid arguments, malformed JSON input)
pub const USAGE_ERROR: i32 = 2;

/// Configuration error (unreadable settings or dataset, invalid values)
pub const CONFIG_ERROR: i32 = 3;

/// Validation error (unknown model or field, invalid template)
pub const VALIDATION_ERROR: i32 = 4;

/// Query rejected as too complex
pub const COMPLEXITY_REJECTION: i32 = 5;

/// Backend failure or timeout
pub const EXECUTION_ERROR: i32 = 6;

/// Workflow finished without completing every step
pub const STEP_FAILURE: i32 = 7;

/// Concurrency limit reached
pub const CAPACITY_ERROR: i32 = 8;

pub fn for_kind(kind: ErrorKind) -> i32 {
  match kind {
    ErrorKind::Validation => VALIDATION_ERROR,
    ErrorKind::ComplexityRejection => COMPLEXITY_REJECTION,
    ErrorKind::Execution => EXECUTION_ERROR,
    ErrorKind::StepFailure => STEP_FAILURE,
    ErrorKind::Capacity => CAPACITY_ERROR,
  }
}
