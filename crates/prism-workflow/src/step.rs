use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One step of a workflow template.
///
/// Serialized with the kind and its payload inline:
/// ```json
/// { "id": "by_region", "kind": "query", "params": { "model": "orders", ... }, "depends_on": [] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
  pub id: String,
  #[serde(flatten)]
  pub kind: StepKind,
  #[serde(default)]
  pub depends_on: Vec<String>,
  /// Per-step deadline, overriding the engine default.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

impl StepDefinition {
  pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
    Self {
      id: id.into(),
      kind,
      depends_on: Vec::new(),
      timeout_ms: None,
    }
  }

  pub fn depends_on<I, S>(mut self, ids: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.depends_on.extend(ids.into_iter().map(Into::into));
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout_ms = Some(timeout.as_millis() as u64);
    self
  }

  pub fn timeout_duration(&self) -> Option<Duration> {
    self.timeout_ms.map(Duration::from_millis)
  }
}

/// The closed set of step kinds, each with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum StepKind {
  Query(QueryStep),
  StatisticalTest(StatisticalTestStep),
  DerivedAnalysis(DerivedOperation),
  InsightSynthesis(InsightSynthesisStep),
}

impl StepKind {
  pub fn tag(&self) -> StepKindTag {
    match self {
      StepKind::Query(_) => StepKindTag::Query,
      StepKind::StatisticalTest(_) => StepKindTag::StatisticalTest,
      StepKind::DerivedAnalysis(_) => StepKindTag::DerivedAnalysis,
      StepKind::InsightSynthesis(_) => StepKindTag::InsightSynthesis,
    }
  }

  /// Step ids the payload reads outputs from. Each must also be a dependency.
  pub fn referenced_steps(&self) -> Vec<&str> {
    match self {
      StepKind::StatisticalTest(test) => vec![test.baseline.as_str(), test.comparison.as_str()],
      StepKind::DerivedAnalysis(DerivedOperation::PercentChange {
        baseline, current, ..
      }) => vec![baseline.as_str(), current.as_str()],
      StepKind::DerivedAnalysis(DerivedOperation::Share { source, .. })
      | StepKind::DerivedAnalysis(DerivedOperation::TopN { source, .. }) => vec![source.as_str()],
      StepKind::Query(_) | StepKind::InsightSynthesis(_) => Vec::new(),
    }
  }
}

/// Payload-free discriminant used to look up executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKindTag {
  Query,
  StatisticalTest,
  DerivedAnalysis,
  InsightSynthesis,
}

impl StepKindTag {
  pub const ALL: [StepKindTag; 4] = [
    StepKindTag::Query,
    StepKindTag::StatisticalTest,
    StepKindTag::DerivedAnalysis,
    StepKindTag::InsightSynthesis,
  ];
}

impl fmt::Display for StepKindTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      StepKindTag::Query => "query",
      StepKindTag::StatisticalTest => "statistical_test",
      StepKindTag::DerivedAnalysis => "derived_analysis",
      StepKindTag::InsightSynthesis => "insight_synthesis",
    };
    f.write_str(name)
  }
}

/// A query against one model.
///
/// Filter values are written in predicate form (`{"eq": "EU"}`) and string
/// leaves may be minijinja templates over start parameters and dependency
/// outputs, e.g. `{"eq": "{{ top_channel.rows[0].channel }}"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStep {
  pub model: String,
  #[serde(default)]
  pub dimensions: Vec<String>,
  #[serde(default)]
  pub measures: Vec<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub filters: BTreeMap<String, serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMethod {
  /// Difference of means with unequal variances.
  #[default]
  WelchT,
  /// Difference of rates; needs `trials_measure`.
  TwoProportionZ,
}

/// Compare one measure between the outputs of two query steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalTestStep {
  #[serde(default)]
  pub method: TestMethod,
  pub measure: String,
  /// Step whose rows form the baseline sample.
  pub baseline: String,
  /// Step whose rows form the comparison sample.
  pub comparison: String,
  /// For proportions: the measure holding the number of trials per row.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub trials_measure: Option<String>,
  #[serde(default = "default_alpha")]
  pub alpha: f64,
}

fn default_alpha() -> f64 {
  0.05
}

/// Arithmetic over the outputs of earlier query steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DerivedOperation {
  /// Per-key change of `measure` from `baseline` to `current`, joined on `key`.
  PercentChange {
    baseline: String,
    current: String,
    measure: String,
    key: String,
  },
  /// Each row's fraction of the `measure` total.
  Share { source: String, measure: String },
  /// The `n` rows with the largest `measure`.
  TopN {
    source: String,
    measure: String,
    n: usize,
  },
}

/// Summarize dependency outputs into ranked findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSynthesisStep {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub focus: Option<String>,
  #[serde(default = "default_max_insights")]
  pub max_insights: usize,
}

impl Default for InsightSynthesisStep {
  fn default() -> Self {
    Self {
      focus: None,
      max_insights: default_max_insights(),
    }
  }
}

fn default_max_insights() -> usize {
  5
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_step_json_shape() {
    let step: StepDefinition = serde_json::from_value(json!({
      "id": "by_region",
      "kind": "query",
      "params": {
        "model": "orders",
        "dimensions": ["region"],
        "measures": ["revenue"],
        "filters": { "month": { "eq": "{{ params.month }}" } }
      },
      "timeout_ms": 500
    }))
    .unwrap();

    assert_eq!(step.id, "by_region");
    assert_eq!(step.kind.tag(), StepKindTag::Query);
    assert!(step.depends_on.is_empty());
    assert_eq!(step.timeout_duration(), Some(Duration::from_millis(500)));
    let StepKind::Query(query) = &step.kind else {
      panic!("expected a query step");
    };
    assert_eq!(query.filters["month"], json!({ "eq": "{{ params.month }}" }));

    let value = serde_json::to_value(&step).unwrap();
    assert_eq!(value["kind"], "query");
    assert_eq!(value["params"]["model"], "orders");
  }

  #[test]
  fn test_payload_defaults() {
    let step: StepDefinition = serde_json::from_value(json!({
      "id": "lift",
      "kind": "statistical_test",
      "params": { "measure": "revenue", "baseline": "a", "comparison": "b" },
      "depends_on": ["a", "b"]
    }))
    .unwrap();
    let StepKind::StatisticalTest(test) = &step.kind else {
      panic!("expected a statistical test");
    };
    assert_eq!(test.method, TestMethod::WelchT);
    assert_eq!(test.alpha, 0.05);
    assert_eq!(step.kind.referenced_steps(), vec!["a", "b"]);

    let step: StepDefinition = serde_json::from_value(json!({
      "id": "summary",
      "kind": "insight_synthesis",
      "params": {}
    }))
    .unwrap();
    assert_eq!(
      step.kind,
      StepKind::InsightSynthesis(InsightSynthesisStep::default())
    );
  }

  #[test]
  fn test_derived_operation_shape() {
    let step: StepDefinition = serde_json::from_value(json!({
      "id": "top",
      "kind": "derived_analysis",
      "params": { "operation": "top_n", "source": "by_region", "measure": "revenue", "n": 2 },
      "depends_on": ["by_region"]
    }))
    .unwrap();
    assert_eq!(
      step.kind,
      StepKind::DerivedAnalysis(DerivedOperation::TopN {
        source: "by_region".to_string(),
        measure: "revenue".to_string(),
        n: 2,
      })
    );
  }

  #[test]
  fn test_unknown_kind_is_rejected() {
    let result: Result<StepDefinition, _> = serde_json::from_value(json!({
      "id": "x",
      "kind": "forecast",
      "params": {}
    }));
    assert!(result.is_err());
  }
}
