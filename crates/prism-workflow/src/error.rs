use std::path::PathBuf;

use prism_query::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
  #[error("template '{0}' not found")]
  NotFound(String),

  #[error("template '{0}' is already registered")]
  DuplicateTemplate(String),

  #[error("template '{template_id}' has no steps")]
  Empty { template_id: String },

  #[error("template '{template_id}' defines step '{step_id}' more than once")]
  DuplicateStep {
    template_id: String,
    step_id: String,
  },

  #[error("step '{step_id}' in template '{template_id}' depends on unknown step '{dependency}'")]
  UnknownDependency {
    template_id: String,
    step_id: String,
    dependency: String,
  },

  #[error("template '{template_id}' has a dependency cycle through {steps:?}")]
  Cycle {
    template_id: String,
    steps: Vec<String>,
  },

  #[error("invalid parameters for step '{step_id}' in template '{template_id}': {message}")]
  InvalidStep {
    template_id: String,
    step_id: String,
    message: String,
  },

  #[error("failed to parse template: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("failed to read templates from {}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl TemplateError {
  pub fn kind(&self) -> ErrorKind {
    ErrorKind::Validation
  }
}
