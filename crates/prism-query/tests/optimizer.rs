//! Integration tests for QueryOptimizer against a call-counting backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prism_config::Settings;
use prism_query::{
  Aggregation, BackendError, DimensionDef, ErrorKind, MeasureDef, ModelCatalog, ModelDefinition,
  Predicate, QueryEngine, QueryError, QueryOptimizer, QueryRequest, QueryResult, Scalar,
  UsageContext,
};
use serde_json::json;
use tokio::sync::Notify;

#[derive(Default)]
struct StubEngine {
  calls: AtomicUsize,
  fail: AtomicBool,
  delay: Option<Duration>,
  seen: Mutex<Vec<QueryRequest>>,
  started: Notify,
}

impl StubEngine {
  fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn last_request(&self) -> QueryRequest {
    self.seen.lock().unwrap().last().cloned().unwrap()
  }
}

#[async_trait]
impl QueryEngine for StubEngine {
  async fn execute(&self, request: &QueryRequest) -> Result<QueryResult, BackendError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.seen.lock().unwrap().push(request.clone());
    self.started.notify_one();

    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.fail.load(Ordering::SeqCst) {
      return Err(BackendError::new("backend unavailable"));
    }

    let rows = (0..3)
      .map(|i| {
        let mut row = serde_json::Map::new();
        for d in &request.dimensions {
          row.insert(d.clone(), json!(format!("{}-{}", d, i)));
        }
        for m in &request.measures {
          row.insert(m.clone(), json!(i * 10));
        }
        row
      })
      .collect();

    Ok(QueryResult {
      columns: request
        .dimensions
        .iter()
        .chain(&request.measures)
        .cloned()
        .collect(),
      rows,
      duration: Duration::from_millis(5),
    })
  }
}

struct Suggests(Vec<&'static str>);

#[async_trait]
impl UsageContext for Suggests {
  async fn recent_dimensions_measures(&self, _model: &str) -> Result<Vec<String>, BackendError> {
    Ok(self.0.iter().map(|s| s.to_string()).collect())
  }
}

struct BrokenContext;

#[async_trait]
impl UsageContext for BrokenContext {
  async fn recent_dimensions_measures(&self, _model: &str) -> Result<Vec<String>, BackendError> {
    Err(BackendError::new("memory store offline"))
  }
}

fn dimension(name: &str, cardinality: u64) -> DimensionDef {
  DimensionDef {
    name: name.to_string(),
    cardinality: Some(cardinality),
  }
}

fn measure(name: &str, aggregation: Aggregation) -> MeasureDef {
  MeasureDef {
    name: name.to_string(),
    aggregation,
    column: None,
  }
}

fn catalog() -> Arc<ModelCatalog> {
  Arc::new(ModelCatalog::new([
    ModelDefinition {
      name: "orders".to_string(),
      description: String::new(),
      dimensions: vec![
        dimension("region", 4),
        dimension("channel", 3),
        dimension("month", 12),
        dimension("order_id", 500_000),
      ],
      measures: vec![
        measure("revenue", Aggregation::Sum),
        measure("order_count", Aggregation::Count),
      ],
      high_volume: false,
    },
    ModelDefinition {
      name: "customers".to_string(),
      description: String::new(),
      dimensions: vec![dimension("segment", 5)],
      measures: vec![measure("customer_count", Aggregation::Count)],
      high_volume: false,
    },
  ]))
}

fn optimizer_with(engine: Arc<StubEngine>, settings: &Settings) -> QueryOptimizer {
  QueryOptimizer::new(catalog(), engine, settings)
}

fn revenue_by_region() -> QueryRequest {
  QueryRequest::new("orders").dimension("region").measure("revenue")
}

#[tokio::test]
async fn test_rejected_query_never_reaches_backend() {
  let engine = Arc::new(StubEngine::default());
  let optimizer = optimizer_with(engine.clone(), &Settings::default());

  let request = QueryRequest::new("orders").dimension("order_id").measure("revenue");
  let err = optimizer.execute(&request, None).await.unwrap_err();

  assert_eq!(err.kind(), ErrorKind::ComplexityRejection);
  assert!(matches!(
    err,
    QueryError::ComplexityRejected {
      estimated_rows: 500_000,
      ..
    }
  ));
  assert_eq!(engine.calls(), 0);
  assert_eq!(optimizer.cache_stats().size, 0);
  assert!(optimizer.history().is_empty());
}

#[tokio::test]
async fn test_unknown_fields_are_validation_errors() {
  let engine = Arc::new(StubEngine::default());
  let optimizer = optimizer_with(engine.clone(), &Settings::default());

  let err = optimizer
    .execute(&QueryRequest::new("orders").measure("margin"), None)
    .await
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Validation);
  assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn test_repeated_query_is_cache_hit() {
  let engine = Arc::new(StubEngine::default());
  let optimizer = optimizer_with(engine.clone(), &Settings::default());

  let first = optimizer.execute(&revenue_by_region(), None).await.unwrap();
  // Same content, different construction order.
  let again = QueryRequest::new("orders").measure("revenue").dimension("region");
  let second = optimizer.execute(&again, None).await.unwrap();

  assert!(!first.cache_hit);
  assert!(second.cache_hit);
  assert_eq!(second.latency, Duration::ZERO);
  assert_eq!(first.cache_key, second.cache_key);
  assert_eq!(first.result, second.result);
  assert_eq!(engine.calls(), 1);

  let history = optimizer.history();
  assert_eq!(history.len(), 2);
  assert!(history[1].cache_hit);
  assert_eq!(history[1].latency, Duration::ZERO);

  let insights = optimizer.performance_insights("orders");
  assert_eq!(insights.query_count, 2);
  assert!((insights.cache_hit_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_cached_result_expires_with_complexity_ttl() {
  let engine = Arc::new(StubEngine::default());
  let optimizer = optimizer_with(engine.clone(), &Settings::default());

  // complexity 18 -> ttl = 60s + 3540s * 18 / 100 = 697.2s
  optimizer.execute(&revenue_by_region(), None).await.unwrap();
  tokio::time::advance(Duration::from_secs(600)).await;
  assert!(optimizer.execute(&revenue_by_region(), None).await.unwrap().cache_hit);

  tokio::time::advance(Duration::from_secs(100)).await;
  assert!(!optimizer.execute(&revenue_by_region(), None).await.unwrap().cache_hit);
  assert_eq!(engine.calls(), 2);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
  let engine = Arc::new(StubEngine::default());
  engine.fail.store(true, Ordering::SeqCst);
  let optimizer = optimizer_with(engine.clone(), &Settings::default());

  for _ in 0..2 {
    let err = optimizer.execute(&revenue_by_region(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(matches!(err, QueryError::Execution { .. }));
  }

  assert_eq!(engine.calls(), 2);
  assert_eq!(optimizer.cache_stats().size, 0);
  let insights = optimizer.performance_insights("orders");
  assert_eq!(insights.failure_count, 2);
  assert!(!insights.suggestions.is_empty());
}

#[tokio::test]
async fn test_enrichment_appends_known_fields_up_to_limit() {
  let engine = Arc::new(StubEngine::default());
  let optimizer = optimizer_with(engine.clone(), &Settings::default());
  let context = Suggests(vec!["region", "colour", "channel", "order_count", "month"]);

  let outcome = optimizer
    .execute(&revenue_by_region(), Some(&context as &dyn UsageContext))
    .await
    .unwrap();

  assert_eq!(outcome.enriched_with, vec!["channel", "order_count"]);
  let sent = engine.last_request();
  assert_eq!(sent.dimensions, vec!["region", "channel"]);
  assert_eq!(sent.measures, vec!["revenue", "order_count"]);

  // The enriched result is cached under the caller's request.
  let again = optimizer.execute(&revenue_by_region(), None).await.unwrap();
  assert!(again.cache_hit);
  assert_eq!(again.enriched_with, vec!["channel", "order_count"]);
}

#[tokio::test]
async fn test_enrichment_dropped_when_it_breaches_limits() {
  let engine = Arc::new(StubEngine::default());
  let mut settings = Settings::default();
  settings.complexity.max_complexity = 30;
  let optimizer = optimizer_with(engine.clone(), &settings);
  let context = Suggests(vec!["customers.segment"]);

  // 18 on its own, 33 with the foreign dimension and its join.
  let outcome = optimizer
    .execute(&revenue_by_region(), Some(&context as &dyn UsageContext))
    .await
    .unwrap();

  assert!(outcome.enriched_with.is_empty());
  assert_eq!(outcome.score.complexity, 18);
  assert_eq!(engine.last_request(), revenue_by_region());
}

#[tokio::test]
async fn test_broken_usage_context_means_no_enrichment() {
  let engine = Arc::new(StubEngine::default());
  let optimizer = optimizer_with(engine.clone(), &Settings::default());

  let outcome = optimizer
    .execute(&revenue_by_region(), Some(&BrokenContext as &dyn UsageContext))
    .await
    .unwrap();

  assert!(outcome.enriched_with.is_empty());
  assert_eq!(engine.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backend_timeout_is_execution_error() {
  let engine = Arc::new(StubEngine {
    delay: Some(Duration::from_secs(10)),
    ..Default::default()
  });
  let mut settings = Settings::default();
  settings.optimizer.query_timeout_ms = 100;
  let optimizer = optimizer_with(engine.clone(), &settings);

  let err = optimizer.execute(&revenue_by_region(), None).await.unwrap_err();

  assert!(matches!(err, QueryError::Timeout { .. }));
  assert_eq!(err.kind(), ErrorKind::Execution);
  assert_eq!(optimizer.cache_stats().size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_admission_is_bounded() {
  let engine = Arc::new(StubEngine {
    delay: Some(Duration::from_secs(10)),
    ..Default::default()
  });
  let mut settings = Settings::default();
  settings.optimizer.max_concurrent_queries = 1;
  settings.optimizer.admission_timeout_ms = 50;
  let optimizer = Arc::new(optimizer_with(engine.clone(), &settings));

  let background = {
    let optimizer = optimizer.clone();
    tokio::spawn(async move { optimizer.execute(&revenue_by_region(), None).await })
  };
  engine.started.notified().await;

  let other = QueryRequest::new("orders").dimension("month").measure("revenue");
  let err = optimizer.execute(&other, None).await.unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Capacity);
  assert_eq!(engine.calls(), 1);
  let insights = optimizer.performance_insights("orders");
  assert_eq!(insights.failure_count, 0);
  assert!(insights.suggestions.iter().all(|s| !s.contains("backend health")));
  background.abort();
}

#[tokio::test]
async fn test_invalidate_model_forces_reexecution() {
  let engine = Arc::new(StubEngine::default());
  let optimizer = optimizer_with(engine.clone(), &Settings::default());
  let filtered = revenue_by_region().filter("channel", Predicate::Eq(Scalar::Str("web".into())));

  optimizer.execute(&filtered, None).await.unwrap();
  optimizer
    .execute(&QueryRequest::new("customers").dimension("segment").measure("customer_count"), None)
    .await
    .unwrap();
  assert_eq!(optimizer.invalidate_model("orders"), 1);
  assert_eq!(optimizer.cache_stats().size, 1);

  assert!(!optimizer.execute(&filtered, None).await.unwrap().cache_hit);
  assert_eq!(engine.calls(), 3);
}

#[tokio::test]
async fn test_history_feeds_row_estimates() {
  let engine = Arc::new(StubEngine::default());
  let optimizer = optimizer_with(engine.clone(), &Settings::default());

  // Declared cardinality says 500k; the backend returns 3 rows.
  let limited = QueryRequest::new("orders")
    .dimension("order_id")
    .measure("revenue")
    .limit(10);
  optimizer.execute(&limited, None).await.unwrap();
  let unlimited = QueryRequest::new("orders").dimension("order_id").measure("revenue");
  assert_eq!(optimizer.estimate(&unlimited).unwrap().estimated_rows, 500_000);

  let mut settings = Settings::default();
  settings.complexity.max_estimated_rows = 1_000_000;
  let lenient = optimizer_with(engine.clone(), &settings);
  lenient.execute(&unlimited, None).await.unwrap();
  assert_eq!(lenient.estimate(&unlimited).unwrap().estimated_rows, 3);
}
