use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("settings file not found: {}", .0.display())]
  FileNotFound(PathBuf),

  #[error("failed to load settings: {0}")]
  Load(#[from] config::ConfigError),

  #[error("invalid setting '{field}': {message}")]
  Invalid { field: String, message: String },
}

impl ConfigError {
  pub(crate) fn invalid(field: &str, message: &str) -> Self {
    Self::Invalid {
      field: field.to_string(),
      message: message.to_string(),
    }
  }
}
