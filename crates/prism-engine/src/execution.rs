//! Execution state as callers see it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prism_query::{ErrorKind, Predicate};
use prism_workflow::{FailurePolicy, StepKindTag};
use serde::{Deserialize, Serialize};

use crate::error::StepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Pending,
  Running,
  Completed,
  Failed,
  PartiallyFailed,
  Cancelled,
}

impl ExecutionStatus {
  pub fn is_terminal(self) -> bool {
    !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
  Skipped,
}

impl StepStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
    )
  }
}

/// Serializable form of a step error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
  pub kind: ErrorKind,
  pub message: String,
}

impl From<&StepError> for ErrorReport {
  fn from(error: &StepError) -> Self {
    Self {
      kind: error.kind(),
      message: error.to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
  pub step_id: String,
  pub kind: StepKindTag,
  pub status: StepStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<ErrorReport>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
  pub(crate) fn pending(step_id: &str, kind: StepKindTag) -> Self {
    Self {
      step_id: step_id.to_string(),
      kind,
      status: StepStatus::Pending,
      output: None,
      error: None,
      started_at: None,
      finished_at: None,
    }
  }
}

/// Outputs of the terminal steps plus the full manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
  /// Outputs of succeeded steps nothing depends on, keyed (and ordered) by step id.
  pub outputs: BTreeMap<String, serde_json::Value>,
  /// Every step result, in topological order.
  pub manifest: Vec<StepResult>,
}

/// Snapshot of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
  pub execution_id: String,
  pub template_id: String,
  pub status: ExecutionStatus,
  pub failure_policy: FailurePolicy,
  pub steps: BTreeMap<String, StepResult>,
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<AggregateResult>,
}

impl WorkflowExecution {
  pub fn step(&self, step_id: &str) -> Option<&StepResult> {
    self.steps.get(step_id)
  }

  pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
    self.steps.get(step_id).map(|s| s.status)
  }
}

/// Per-execution inputs supplied to `start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
  /// Exposed to step templates as `params`.
  #[serde(default)]
  pub args: serde_json::Map<String, serde_json::Value>,
  /// Applied to every query step whose model has the dimension. Filters the
  /// step defines itself take precedence.
  #[serde(default)]
  pub filters: BTreeMap<String, Predicate>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure_policy: Option<FailurePolicy>,
  /// Execution deadline, overriding the template's.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

impl StartParams {
  pub fn arg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
    self.args.insert(name.into(), value);
    self
  }

  pub fn filter(mut self, key: impl Into<String>, predicate: Predicate) -> Self {
    self.filters.insert(key.into(), predicate);
    self
  }

  pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
    self.failure_policy = Some(policy);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout_ms = Some(timeout.as_millis() as u64);
    self
  }
}
