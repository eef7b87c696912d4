//! The query optimizer: cache, admission control, enrichment, execution.

use std::sync::Arc;
use std::time::Duration;

use prism_config::{CacheSettings, OptimizerSettings, Settings};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::{QueryEngine, QueryResult, UsageContext};
use crate::batch::{BatchSuggestion, batch_opportunities};
use crate::cache::{CacheStats, ResultCache};
use crate::complexity::{ComplexityEstimator, ComplexityScore, RowEstimator};
use crate::error::{ErrorKind, QueryError};
use crate::history::{ExecutionHistory, ExecutionRecord, PerformanceInsights};
use crate::model::{ModelCatalog, ModelDefinition};
use crate::request::{CacheKey, QueryRequest};

#[derive(Clone)]
struct CachedResult {
  result: Arc<QueryResult>,
  score: ComplexityScore,
  enriched_with: Vec<String>,
}

/// What `QueryOptimizer::execute` returns.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
  pub cache_key: CacheKey,
  pub result: Arc<QueryResult>,
  pub cache_hit: bool,
  pub score: ComplexityScore,
  /// Fields appended by enrichment, in the order they were added.
  pub enriched_with: Vec<String>,
  /// Wall time spent in this call; zero for cache hits.
  pub latency: Duration,
}

/// Composes the result cache, complexity estimator and execution history in
/// front of a query backend.
pub struct QueryOptimizer {
  catalog: Arc<ModelCatalog>,
  engine: Arc<dyn QueryEngine>,
  estimator: ComplexityEstimator,
  cache: ResultCache<CachedResult>,
  history: ExecutionHistory,
  admission: Semaphore,
  cache_settings: CacheSettings,
  settings: OptimizerSettings,
}

impl QueryOptimizer {
  pub fn new(catalog: Arc<ModelCatalog>, engine: Arc<dyn QueryEngine>, settings: &Settings) -> Self {
    let history = ExecutionHistory::new(
      settings.optimizer.history_max_records,
      settings.optimizer.history_max_age(),
    );
    Self {
      catalog,
      engine,
      estimator: ComplexityEstimator::new(settings.complexity.clone()),
      cache: ResultCache::new(settings.cache.capacity, settings.cache.default_ttl()),
      history,
      admission: Semaphore::new(settings.optimizer.max_concurrent_queries.max(1)),
      cache_settings: settings.cache.clone(),
      settings: settings.optimizer.clone(),
    }
  }

  /// Replace the estimator's row estimation strategy.
  pub fn with_row_estimator(mut self, rows: impl RowEstimator + 'static) -> Self {
    self.estimator = self.estimator.with_row_estimator(rows);
    self
  }

  pub fn catalog(&self) -> &ModelCatalog {
    &self.catalog
  }

  /// Validate and score a request without running it.
  pub fn estimate(&self, request: &QueryRequest) -> Result<ComplexityScore, QueryError> {
    let request = request.clone().normalized();
    self.catalog.validate(&request)?;
    Ok(self.estimator.score(&self.catalog, &request, &self.history))
  }

  /// Execute a request, serving it from the cache when possible.
  #[instrument(
    name = "query_execute",
    skip(self, request, context),
    fields(model = %request.model)
  )]
  pub async fn execute(
    &self,
    request: &QueryRequest,
    context: Option<&dyn UsageContext>,
  ) -> Result<QueryOutcome, QueryError> {
    let request = request.clone().normalized();
    let model = self.catalog.validate(&request)?;
    let cache_key = request.cache_key();

    if let Some(cached) = self.cache.get(&cache_key) {
      debug!(key = %cache_key, "query_cache_hit");
      self.history.record(ExecutionRecord::succeeded(
        &request,
        Duration::ZERO,
        true,
        cached.result.row_count(),
      ));
      return Ok(QueryOutcome {
        cache_key,
        result: cached.result,
        cache_hit: true,
        score: cached.score,
        enriched_with: cached.enriched_with,
        latency: Duration::ZERO,
      });
    }

    let score = self.estimator.score(&self.catalog, &request, &self.history);
    if let Err(limit) = self.estimator.check(&score) {
      info!(
        key = %cache_key,
        complexity = score.complexity,
        estimated_rows = score.estimated_rows,
        limit = %limit,
        "query_rejected"
      );
      return Err(QueryError::ComplexityRejected {
        model: request.model.clone(),
        complexity: score.complexity,
        estimated_rows: score.estimated_rows,
        limit,
      });
    }
    for warning in &score.warnings {
      debug!(key = %cache_key, warning = %warning, "query_warning");
    }

    let (effective, score, enriched_with) = match context {
      Some(context) if self.settings.enrichment_enabled => {
        self.enrich(model, &request, score, context).await
      }
      _ => (request.clone(), score, Vec::new()),
    };

    let started = Instant::now();
    let result = self.run(&effective).await;
    let latency = started.elapsed();

    match result {
      Ok(result) => {
        let result = Arc::new(result);
        self.history.record(ExecutionRecord::succeeded(
          &request,
          latency,
          false,
          result.row_count(),
        ));
        self.cache.put(
          cache_key.clone(),
          CachedResult {
            result: result.clone(),
            score: score.clone(),
            enriched_with: enriched_with.clone(),
          },
          Some(self.ttl_for(score.complexity)),
        );
        info!(
          key = %cache_key,
          rows = result.row_count(),
          latency_ms = latency.as_millis() as u64,
          complexity = score.complexity,
          "query_completed"
        );
        Ok(QueryOutcome {
          cache_key,
          result,
          cache_hit: false,
          score,
          enriched_with,
          latency,
        })
      }
      Err(e) => {
        // Admission rejections never reached the backend.
        if e.kind() == ErrorKind::Execution {
          self.history.record(ExecutionRecord::failed(&request, latency));
        }
        warn!(key = %cache_key, error = %e, "query_failed");
        Err(e)
      }
    }
  }

  /// Admit and run one request against the backend.
  async fn run(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
    let _permit = match tokio::time::timeout(
      self.settings.admission_timeout(),
      self.admission.acquire(),
    )
    .await
    {
      Ok(Ok(permit)) => permit,
      Ok(Err(_)) => {
        return Err(QueryError::Capacity {
          message: "admission closed".to_string(),
        });
      }
      Err(_) => {
        return Err(QueryError::Capacity {
          message: format!(
            "no query slot within {:?} ({} in flight)",
            self.settings.admission_timeout(),
            self.settings.max_concurrent_queries
          ),
        });
      }
    };

    let timeout = self.settings.query_timeout();
    match tokio::time::timeout(timeout, self.engine.execute(request)).await {
      Ok(Ok(result)) => Ok(result),
      Ok(Err(source)) => Err(QueryError::Execution {
        model: request.model.clone(),
        source,
      }),
      Err(_) => Err(QueryError::Timeout {
        model: request.model.clone(),
        timeout,
      }),
    }
  }

  /// Append fields the usage context suggests, keeping the original request if
  /// the enriched one would breach a limit.
  async fn enrich(
    &self,
    model: &ModelDefinition,
    request: &QueryRequest,
    score: ComplexityScore,
    context: &dyn UsageContext,
  ) -> (QueryRequest, ComplexityScore, Vec<String>) {
    let suggestions = match context.recent_dimensions_measures(&request.model).await {
      Ok(suggestions) => suggestions,
      Err(e) => {
        debug!(model = %request.model, error = %e, "enrichment_unavailable");
        return (request.clone(), score, Vec::new());
      }
    };

    let mut enriched = request.clone();
    let mut added = Vec::new();
    for name in suggestions {
      if added.len() >= self.settings.max_enrichment {
        break;
      }
      if enriched.dimensions.contains(&name) || enriched.measures.contains(&name) {
        continue;
      }
      if model.measure(&name).is_some() {
        enriched = enriched.measure(name.clone());
      } else if self.catalog.resolve_dimension(model, &name).is_some() {
        enriched = enriched.dimension(name.clone());
      } else {
        continue;
      }
      added.push(name);
    }

    if added.is_empty() {
      return (request.clone(), score, added);
    }

    let rescored = self.estimator.score(&self.catalog, &enriched, &self.history);
    if let Err(limit) = self.estimator.check(&rescored) {
      debug!(model = %request.model, limit = %limit, "enrichment_dropped");
      return (request.clone(), score, Vec::new());
    }

    debug!(model = %request.model, added = ?added, "query_enriched");
    (enriched, rescored, added)
  }

  /// TTL interpolated between the configured bounds by complexity.
  fn ttl_for(&self, complexity: u8) -> Duration {
    let min = self.cache_settings.min_ttl();
    let span = self.cache_settings.max_ttl().saturating_sub(min);
    min + span * u32::from(complexity.min(100)) / 100
  }

  pub fn performance_insights(&self, model: &str) -> PerformanceInsights {
    self
      .history
      .insights(model, self.settings.slow_query_threshold())
  }

  pub fn batch_opportunities(&self, pending: &[QueryRequest]) -> Vec<BatchSuggestion> {
    batch_opportunities(pending)
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }

  /// Drop every cached result for `model`.
  pub fn invalidate_model(&self, model: &str) -> usize {
    let removed = self.cache.invalidate_model(model);
    info!(model = %model, removed, "cache_invalidated");
    removed
  }

  /// Snapshot of the retained execution records, oldest first.
  pub fn history(&self) -> Vec<ExecutionRecord> {
    self.history.records()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::tests::retail_catalog;

  struct Empty;

  #[async_trait::async_trait]
  impl QueryEngine for Empty {
    async fn execute(&self, _request: &QueryRequest) -> Result<QueryResult, crate::BackendError> {
      Ok(QueryResult::default())
    }
  }

  fn optimizer(settings: &Settings) -> QueryOptimizer {
    QueryOptimizer::new(Arc::new(retail_catalog()), Arc::new(Empty), settings)
  }

  #[test]
  fn test_ttl_interpolates_between_bounds() {
    let mut settings = Settings::default();
    settings.cache.min_ttl_secs = 100;
    settings.cache.max_ttl_secs = 300;
    let optimizer = optimizer(&settings);

    assert_eq!(optimizer.ttl_for(0), Duration::from_secs(100));
    assert_eq!(optimizer.ttl_for(50), Duration::from_secs(200));
    assert_eq!(optimizer.ttl_for(100), Duration::from_secs(300));
  }

  #[test]
  fn test_estimate_validates_first() {
    let optimizer = optimizer(&Settings::default());
    let err = optimizer
      .estimate(&QueryRequest::new("orders").measure("profit"))
      .unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::Validation);

    let score = optimizer
      .estimate(&QueryRequest::new("orders").dimension("region").measure("revenue"))
      .unwrap();
    assert_eq!(score.complexity, 18);
  }
}
