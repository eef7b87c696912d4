//! The step executor seam and the kind -> executor lookup table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use prism_query::{QueryOptimizer, UsageContext};
use prism_workflow::{StepDefinition, StepKindTag};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
  InsightSynthesisExecutor, InsightSynthesizer, StatisticalTestExecutor, StatisticalTester,
};
use crate::derived::DerivedAnalysisExecutor;
use crate::error::StepError;
use crate::execution::StartParams;
use crate::query::QueryStepExecutor;

/// Output of one succeeded dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInput {
  pub step_id: String,
  pub output: serde_json::Value,
}

/// Everything an executor sees when running a step.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub execution_id: String,
  pub step: StepDefinition,
  /// Dependency outputs, ordered by step id.
  pub inputs: Vec<StepInput>,
  pub params: Arc<StartParams>,
  /// Cancelled when the execution is cancelled or its deadline passes.
  pub cancel: CancellationToken,
}

impl StepContext {
  pub fn input(&self, step_id: &str) -> Option<&serde_json::Value> {
    self
      .inputs
      .iter()
      .find(|i| i.step_id == step_id)
      .map(|i| &i.output)
  }

  /// Like `input`, but a missing dependency is an error.
  pub fn require_input(&self, step_id: &str) -> Result<&serde_json::Value, StepError> {
    self
      .input(step_id)
      .ok_or_else(|| StepError::invalid_input(step_id, "no output available"))
  }
}

/// Runs steps of one kind.
#[async_trait]
pub trait StepExecutor: Send + Sync {
  async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError>;

  /// Check a step's parameters when its template is registered.
  fn validate(&self, _step: &StepDefinition) -> Result<(), String> {
    Ok(())
  }
}

/// Lookup table from step kind to executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
  executors: HashMap<StepKindTag, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// The standard table: queries through the optimizer, the built-in derived
  /// analysis, and the given collaborators for tests and synthesis.
  pub fn standard(
    optimizer: Arc<QueryOptimizer>,
    usage: Option<Arc<dyn UsageContext>>,
    tester: Arc<dyn StatisticalTester>,
    synthesizer: Arc<dyn InsightSynthesizer>,
  ) -> Self {
    Self::new()
      .with(
        StepKindTag::Query,
        Arc::new(QueryStepExecutor::new(optimizer, usage)),
      )
      .with(StepKindTag::DerivedAnalysis, Arc::new(DerivedAnalysisExecutor))
      .with(
        StepKindTag::StatisticalTest,
        Arc::new(StatisticalTestExecutor::new(tester)),
      )
      .with(
        StepKindTag::InsightSynthesis,
        Arc::new(InsightSynthesisExecutor::new(synthesizer)),
      )
  }

  pub fn with(mut self, kind: StepKindTag, executor: Arc<dyn StepExecutor>) -> Self {
    self.register(kind, executor);
    self
  }

  /// Install an executor, returning the one it replaces.
  pub fn register(
    &mut self,
    kind: StepKindTag,
    executor: Arc<dyn StepExecutor>,
  ) -> Option<Arc<dyn StepExecutor>> {
    self.executors.insert(kind, executor)
  }

  pub fn get(&self, kind: StepKindTag) -> Option<Arc<dyn StepExecutor>> {
    self.executors.get(&kind).cloned()
  }

  pub fn contains(&self, kind: StepKindTag) -> bool {
    self.executors.contains_key(&kind)
  }
}
