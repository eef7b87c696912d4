//! Collaborator interfaces: the analytical backend and the usage-pattern provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::request::QueryRequest;

/// Rows returned by the backend for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
  pub columns: Vec<String>,
  pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
  /// Time the backend reports spending on the query.
  #[serde(default)]
  pub duration: Duration,
}

impl QueryResult {
  pub fn row_count(&self) -> u64 {
    self.rows.len() as u64
  }

  /// JSON form handed to downstream workflow steps.
  pub fn to_value(&self) -> serde_json::Value {
    serde_json::json!({
      "columns": self.columns,
      "rows": self.rows,
      "row_count": self.rows.len(),
    })
  }
}

/// Executes validated requests against the analytical store.
#[async_trait]
pub trait QueryEngine: Send + Sync {
  async fn execute(&self, request: &QueryRequest) -> Result<QueryResult, BackendError>;
}

/// Historical context about which fields are usually queried together.
#[async_trait]
pub trait UsageContext: Send + Sync {
  /// Dimension and measure names recently used with `model`, most relevant first.
  async fn recent_dimensions_measures(&self, model: &str) -> Result<Vec<String>, BackendError>;
}
