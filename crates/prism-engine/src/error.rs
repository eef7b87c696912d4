//! Engine and step errors.

use std::time::Duration;

use prism_query::{ErrorKind, QueryError};
use prism_workflow::{StepKindTag, TemplateError};

/// Errors returned by `WorkflowEngine` operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error(transparent)]
  Template(#[from] TemplateError),

  /// A template uses a step kind no executor is registered for.
  #[error("no executor registered for {kind} step '{step_id}' in template '{template_id}'")]
  MissingExecutor {
    template_id: String,
    step_id: String,
    kind: StepKindTag,
  },

  #[error("execution '{0}' not found")]
  ExecutionNotFound(String),

  #[error("{active} executions are active (max {max})")]
  Capacity { active: usize, max: usize },
}

impl EngineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      EngineError::Template(e) => e.kind(),
      EngineError::MissingExecutor { .. } | EngineError::ExecutionNotFound(_) => {
        ErrorKind::Validation
      }
      EngineError::Capacity { .. } => ErrorKind::Capacity,
    }
  }
}

/// Why a single step failed.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
  /// Parameters could not be rendered or did not make a valid request.
  #[error("failed to resolve inputs: {message}")]
  Input { message: String },

  /// A dependency output the step reads is absent or malformed.
  #[error("invalid input from step '{step_id}': {message}")]
  InvalidInput { step_id: String, message: String },

  #[error(transparent)]
  Query(#[from] QueryError),

  /// An external collaborator reported an error.
  #[error("{collaborator} failed: {message}")]
  Collaborator {
    collaborator: &'static str,
    message: String,
  },

  #[error("step timed out after {0:?}")]
  Timeout(Duration),

  #[error("workflow deadline exceeded")]
  DeadlineExceeded,

  #[error("step cancelled")]
  Cancelled,

  #[error("step executor panicked")]
  Panicked,
}

impl StepError {
  pub(crate) fn input(message: impl Into<String>) -> Self {
    StepError::Input {
      message: message.into(),
    }
  }

  pub(crate) fn invalid_input(step_id: &str, message: impl Into<String>) -> Self {
    StepError::InvalidInput {
      step_id: step_id.to_string(),
      message: message.into(),
    }
  }

  /// Query errors keep their own class; everything else is a step failure.
  pub fn kind(&self) -> ErrorKind {
    match self {
      StepError::Query(e) => e.kind(),
      _ => ErrorKind::StepFailure,
    }
  }
}
