use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TemplateError;
use crate::graph::Graph;
use crate::step::StepDefinition;

/// What the engine does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
  /// Stop dispatching, skip everything not yet started, end Failed.
  FailFast,
  /// Skip only the failed step's descendants, end PartiallyFailed.
  #[default]
  BestEffort,
}

/// A named, reusable workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub steps: Vec<StepDefinition>,
  #[serde(default)]
  pub failure_policy: FailurePolicy,
  /// Deadline for the whole execution.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

/// Listing entry for a registered template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSummary {
  pub id: String,
  pub name: String,
  pub description: String,
  pub steps: Vec<String>,
  pub failure_policy: FailurePolicy,
}

impl WorkflowTemplate {
  pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      description: String::new(),
      steps: Vec::new(),
      failure_policy: FailurePolicy::default(),
      timeout_ms: None,
    }
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn step(mut self, step: StepDefinition) -> Self {
    self.steps.push(step);
    self
  }

  pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
    self.failure_policy = policy;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout_ms = Some(timeout.as_millis() as u64);
    self
  }

  pub fn timeout_duration(&self) -> Option<Duration> {
    self.timeout_ms.map(Duration::from_millis)
  }

  pub fn get_step(&self, step_id: &str) -> Option<&StepDefinition> {
    self.steps.iter().find(|s| s.id == step_id)
  }

  /// Build the graph structure for traversal.
  pub fn graph(&self) -> Graph {
    Graph::new(&self.steps)
  }

  /// Check structural invariants: unique ids, known dependencies, payload
  /// references covered by dependencies, and no cycles.
  ///
  /// Returns the validated graph.
  pub fn validate(&self) -> Result<Graph, TemplateError> {
    if self.steps.is_empty() {
      return Err(TemplateError::Empty {
        template_id: self.id.clone(),
      });
    }

    let mut ids = HashSet::new();
    for step in &self.steps {
      if step.id.is_empty() || !ids.insert(step.id.as_str()) {
        return Err(TemplateError::DuplicateStep {
          template_id: self.id.clone(),
          step_id: step.id.clone(),
        });
      }
    }

    for step in &self.steps {
      for dependency in &step.depends_on {
        if !ids.contains(dependency.as_str()) {
          return Err(TemplateError::UnknownDependency {
            template_id: self.id.clone(),
            step_id: step.id.clone(),
            dependency: dependency.clone(),
          });
        }
      }

      for referenced in step.kind.referenced_steps() {
        if !step.depends_on.iter().any(|d| d == referenced) {
          return Err(TemplateError::InvalidStep {
            template_id: self.id.clone(),
            step_id: step.id.clone(),
            message: format!("reads step '{}' without depending on it", referenced),
          });
        }
      }
    }

    let graph = self.graph();
    graph
      .topological_order()
      .map_err(|steps| TemplateError::Cycle {
        template_id: self.id.clone(),
        steps,
      })?;
    Ok(graph)
  }

  pub fn summary(&self) -> TemplateSummary {
    TemplateSummary {
      id: self.id.clone(),
      name: self.name.clone(),
      description: self.description.clone(),
      steps: self.steps.iter().map(|s| s.id.clone()).collect(),
      failure_policy: self.failure_policy,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::step::{DerivedOperation, InsightSynthesisStep, StepKind};

  fn synth(id: &str) -> StepDefinition {
    StepDefinition::new(id, StepKind::InsightSynthesis(InsightSynthesisStep::default()))
  }

  #[test]
  fn test_valid_template() {
    let template = WorkflowTemplate::new("t", "T")
      .step(synth("a"))
      .step(synth("b").depends_on(["a"]));
    let graph = template.validate().unwrap();
    assert_eq!(graph.topological_order().unwrap(), vec!["a", "b"]);
    assert_eq!(template.failure_policy, FailurePolicy::BestEffort);
  }

  #[test]
  fn test_rejects_cycle() {
    let template = WorkflowTemplate::new("t", "T")
      .step(synth("a").depends_on(["b"]))
      .step(synth("b").depends_on(["a"]));
    assert!(matches!(
      template.validate(),
      Err(TemplateError::Cycle { ref steps, .. }) if steps == &["a", "b"]
    ));
  }

  #[test]
  fn test_rejects_self_dependency() {
    let template = WorkflowTemplate::new("t", "T").step(synth("a").depends_on(["a"]));
    assert!(matches!(template.validate(), Err(TemplateError::Cycle { .. })));
  }

  #[test]
  fn test_rejects_dangling_dependency() {
    let template = WorkflowTemplate::new("t", "T").step(synth("a").depends_on(["ghost"]));
    assert!(matches!(
      template.validate(),
      Err(TemplateError::UnknownDependency { ref dependency, .. }) if dependency == "ghost"
    ));
  }

  #[test]
  fn test_rejects_duplicate_and_empty() {
    let template = WorkflowTemplate::new("t", "T").step(synth("a")).step(synth("a"));
    assert!(matches!(
      template.validate(),
      Err(TemplateError::DuplicateStep { .. })
    ));

    let template = WorkflowTemplate::new("t", "T");
    assert!(matches!(template.validate(), Err(TemplateError::Empty { .. })));
  }

  #[test]
  fn test_rejects_reference_without_dependency() {
    let template = WorkflowTemplate::new("t", "T").step(synth("a")).step(StepDefinition::new(
      "share",
      StepKind::DerivedAnalysis(DerivedOperation::Share {
        source: "a".to_string(),
        measure: "revenue".to_string(),
      }),
    ));
    assert!(matches!(
      template.validate(),
      Err(TemplateError::InvalidStep { .. })
    ));
  }

  #[test]
  fn test_template_json_defaults() {
    let template: WorkflowTemplate = serde_json::from_value(serde_json::json!({
      "id": "t",
      "name": "T",
      "steps": [{ "id": "a", "kind": "insight_synthesis", "params": {} }]
    }))
    .unwrap();
    assert_eq!(template.failure_policy, FailurePolicy::BestEffort);
    assert_eq!(template.timeout_duration(), None);
    assert!(template.validate().is_ok());
  }
}
