//! Query steps, executed through the optimizer.

use std::sync::Arc;

use async_trait::async_trait;
use prism_query::{QueryOptimizer, QueryRequest, UsageContext};
use prism_workflow::{QueryStep, StepDefinition, StepKind};
use serde_json::json;

use crate::error::StepError;
use crate::executor::{StepContext, StepExecutor};
use crate::input::{check_predicate_shape, resolve_filters, template_context};

pub struct QueryStepExecutor {
  optimizer: Arc<QueryOptimizer>,
  usage: Option<Arc<dyn UsageContext>>,
}

impl QueryStepExecutor {
  pub fn new(optimizer: Arc<QueryOptimizer>, usage: Option<Arc<dyn UsageContext>>) -> Self {
    Self { optimizer, usage }
  }

  /// Resolve the step's templated filters and merge in the start filters.
  fn build_request(&self, query: &QueryStep, ctx: &StepContext) -> Result<QueryRequest, StepError> {
    let context = template_context(&ctx.params, &ctx.inputs);
    let mut filters = resolve_filters(&query.filters, &context)?;

    if let Some(model) = self.optimizer.catalog().get(&query.model) {
      for (key, predicate) in &ctx.params.filters {
        if model.dimension(key).is_some() && !filters.contains_key(key) {
          filters.insert(key.clone(), predicate.clone());
        }
      }
    }

    let mut request = QueryRequest::new(&query.model)
      .dimensions(&query.dimensions)
      .measures(&query.measures);
    request.filters = filters;
    request.limit = query.limit;
    Ok(request)
  }
}

#[async_trait]
impl StepExecutor for QueryStepExecutor {
  async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
    let StepKind::Query(query) = &ctx.step.kind else {
      return Err(StepError::input("not a query step"));
    };
    let request = self.build_request(query, ctx)?;
    let outcome = self.optimizer.execute(&request, self.usage.as_deref()).await?;

    let mut output = outcome.result.to_value();
    if let Some(map) = output.as_object_mut() {
      map.insert("model".to_string(), json!(request.model));
      map.insert("cache_hit".to_string(), json!(outcome.cache_hit));
      map.insert("complexity".to_string(), json!(outcome.score.complexity));
      if !outcome.enriched_with.is_empty() {
        map.insert("enriched_with".to_string(), json!(outcome.enriched_with));
      }
    }
    Ok(output)
  }

  /// Check names against the catalog. Filter values may be templates, so only
  /// their keys and shape are checked here.
  fn validate(&self, step: &StepDefinition) -> Result<(), String> {
    let StepKind::Query(query) = &step.kind else {
      return Err("not a query step".to_string());
    };
    let catalog = self.optimizer.catalog();
    let request = QueryRequest::new(&query.model)
      .dimensions(&query.dimensions)
      .measures(&query.measures)
      .limit(query.limit.unwrap_or(1));
    let model = catalog.validate(&request).map_err(|e| e.to_string())?;
    if query.limit == Some(0) {
      return Err("limit must be greater than zero".to_string());
    }

    for (key, value) in &query.filters {
      if catalog.resolve_dimension(model, key).is_none() && model.measure(key).is_none() {
        return Err(format!("unknown filter '{}' on model '{}'", key, model.name));
      }
      check_predicate_shape(key, value)?;
    }
    Ok(())
  }
}
