//! External analysis collaborators and the executors that adapt them.

use std::sync::Arc;

use async_trait::async_trait;
use prism_query::BackendError;
use prism_workflow::{InsightSynthesisStep, StatisticalTestStep, StepDefinition, StepKind, TestMethod};

use crate::error::StepError;
use crate::executor::{StepContext, StepExecutor, StepInput};

/// Significance testing service.
#[async_trait]
pub trait StatisticalTester: Send + Sync {
  /// Compare `params.measure` between two query outputs.
  async fn test(
    &self,
    params: &StatisticalTestStep,
    baseline: &serde_json::Value,
    comparison: &serde_json::Value,
  ) -> Result<serde_json::Value, BackendError>;
}

/// Turns dependency outputs into ranked findings.
#[async_trait]
pub trait InsightSynthesizer: Send + Sync {
  async fn synthesize(
    &self,
    params: &InsightSynthesisStep,
    inputs: &[StepInput],
  ) -> Result<serde_json::Value, BackendError>;
}

pub struct StatisticalTestExecutor {
  tester: Arc<dyn StatisticalTester>,
}

impl StatisticalTestExecutor {
  pub fn new(tester: Arc<dyn StatisticalTester>) -> Self {
    Self { tester }
  }
}

#[async_trait]
impl StepExecutor for StatisticalTestExecutor {
  async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
    let StepKind::StatisticalTest(params) = &ctx.step.kind else {
      return Err(StepError::input("not a statistical test step"));
    };
    let baseline = ctx.require_input(&params.baseline)?;
    let comparison = ctx.require_input(&params.comparison)?;

    self
      .tester
      .test(params, baseline, comparison)
      .await
      .map_err(|e| StepError::Collaborator {
        collaborator: "statistical tester",
        message: e.message,
      })
  }

  fn validate(&self, step: &StepDefinition) -> Result<(), String> {
    let StepKind::StatisticalTest(params) = &step.kind else {
      return Err("not a statistical test step".to_string());
    };
    if !(params.alpha > 0.0 && params.alpha < 1.0) {
      return Err(format!("alpha must be in (0, 1), got {}", params.alpha));
    }
    if params.method == TestMethod::TwoProportionZ && params.trials_measure.is_none() {
      return Err("two_proportion_z needs trials_measure".to_string());
    }
    if params.baseline == params.comparison {
      return Err("baseline and comparison must be different steps".to_string());
    }
    Ok(())
  }
}

pub struct InsightSynthesisExecutor {
  synthesizer: Arc<dyn InsightSynthesizer>,
}

impl InsightSynthesisExecutor {
  pub fn new(synthesizer: Arc<dyn InsightSynthesizer>) -> Self {
    Self { synthesizer }
  }
}

#[async_trait]
impl StepExecutor for InsightSynthesisExecutor {
  async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
    let StepKind::InsightSynthesis(params) = &ctx.step.kind else {
      return Err(StepError::input("not an insight synthesis step"));
    };

    self
      .synthesizer
      .synthesize(params, &ctx.inputs)
      .await
      .map_err(|e| StepError::Collaborator {
        collaborator: "insight synthesizer",
        message: e.message,
      })
  }

  fn validate(&self, step: &StepDefinition) -> Result<(), String> {
    match &step.kind {
      StepKind::InsightSynthesis(params) if params.max_insights == 0 => {
        Err("max_insights must be at least 1".to_string())
      }
      StepKind::InsightSynthesis(_) if step.depends_on.is_empty() => {
        Err("synthesis needs at least one dependency".to_string())
      }
      StepKind::InsightSynthesis(_) => Ok(()),
      _ => Err("not an insight synthesis step".to_string()),
    }
  }
}
