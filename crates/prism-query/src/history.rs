//! Append-only record of query executions.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::complexity::CardinalityHints;
use crate::request::QueryRequest;

/// One query execution, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
  pub query_hash: String,
  pub model: String,
  pub dimension_count: usize,
  pub measure_count: usize,
  pub first_dimension: Option<String>,
  pub limit: Option<u64>,
  /// Whether any filter narrowed the result.
  pub filtered: bool,
  pub latency: Duration,
  pub cache_hit: bool,
  pub succeeded: bool,
  pub row_count: Option<u64>,
  pub recorded_at: DateTime<Utc>,
  #[serde(skip)]
  recorded: Instant,
}

impl ExecutionRecord {
  /// A query that returned `row_count` rows, from the backend or the cache.
  pub fn succeeded(
    request: &QueryRequest,
    latency: Duration,
    cache_hit: bool,
    row_count: u64,
  ) -> Self {
    Self::build(request, latency, cache_hit, Some(row_count))
  }

  /// A query the backend failed to execute.
  pub fn failed(request: &QueryRequest, latency: Duration) -> Self {
    Self::build(request, latency, false, None)
  }

  fn build(
    request: &QueryRequest,
    latency: Duration,
    cache_hit: bool,
    row_count: Option<u64>,
  ) -> Self {
    Self {
      query_hash: request.cache_key().digest().to_string(),
      model: request.model.clone(),
      dimension_count: request.dimensions.len(),
      measure_count: request.measures.len(),
      first_dimension: request.dimensions.first().cloned(),
      limit: request.limit,
      filtered: !request.filters.is_empty(),
      latency,
      cache_hit,
      succeeded: row_count.is_some(),
      row_count,
      recorded_at: Utc::now(),
      recorded: Instant::now(),
    }
  }
}

/// Aggregate view over the retained records of one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceInsights {
  pub model: String,
  pub query_count: usize,
  /// Mean latency of executed (non-cached) queries.
  pub avg_latency: Duration,
  pub cache_hit_rate: f64,
  pub slow_query_count: usize,
  pub failure_count: usize,
  pub suggestions: Vec<String>,
}

/// Bounded execution history: at most `max_records`, none older than `max_age`.
pub struct ExecutionHistory {
  max_records: usize,
  max_age: Duration,
  records: Mutex<VecDeque<ExecutionRecord>>,
}

impl ExecutionHistory {
  pub fn new(max_records: usize, max_age: Duration) -> Self {
    Self {
      max_records: max_records.max(1),
      max_age,
      records: Mutex::new(VecDeque::new()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, VecDeque<ExecutionRecord>> {
    self.records.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn prune(&self, records: &mut VecDeque<ExecutionRecord>) {
    let now = Instant::now();
    while records
      .front()
      .is_some_and(|r| now.duration_since(r.recorded) > self.max_age)
    {
      records.pop_front();
    }
    while records.len() > self.max_records {
      records.pop_front();
    }
  }

  pub fn record(&self, record: ExecutionRecord) {
    let mut records = self.lock();
    records.push_back(record);
    self.prune(&mut records);
  }

  /// Snapshot of the retained records, oldest first.
  pub fn records(&self) -> Vec<ExecutionRecord> {
    let mut records = self.lock();
    self.prune(&mut records);
    records.iter().cloned().collect()
  }

  pub fn len(&self) -> usize {
    let mut records = self.lock();
    self.prune(&mut records);
    records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Summarize the retained records for `model`.
  pub fn insights(&self, model: &str, slow_threshold: Duration) -> PerformanceInsights {
    let records = self.records();
    let relevant: Vec<&ExecutionRecord> = records.iter().filter(|r| r.model == model).collect();

    let executed: Vec<&&ExecutionRecord> = relevant.iter().filter(|r| !r.cache_hit).collect();
    let hits = relevant.len() - executed.len();
    let avg_latency = if executed.is_empty() {
      Duration::ZERO
    } else {
      executed.iter().map(|r| r.latency).sum::<Duration>() / executed.len() as u32
    };
    let cache_hit_rate = if relevant.is_empty() {
      0.0
    } else {
      hits as f64 / relevant.len() as f64
    };
    let slow_query_count = executed
      .iter()
      .filter(|r| r.latency >= slow_threshold)
      .count();
    let failure_count = relevant.iter().filter(|r| !r.succeeded).count();

    let mut suggestions = Vec::new();
    if slow_query_count > 0 {
      suggestions.push(format!(
        "{} slow queries on '{}'; add filters or a row limit",
        slow_query_count, model
      ));
    }
    if relevant.len() >= 10 && cache_hit_rate < 0.2 {
      suggestions.push(format!(
        "cache hit rate {:.0}% on '{}'; queries rarely repeat, consider batching",
        cache_hit_rate * 100.0,
        model
      ));
    }
    if failure_count > 0 {
      suggestions.push(format!(
        "{} failed queries on '{}'; check backend health",
        failure_count, model
      ));
    }

    PerformanceInsights {
      model: model.to_string(),
      query_count: relevant.len(),
      avg_latency,
      cache_hit_rate,
      slow_query_count,
      failure_count,
      suggestions,
    }
  }
}

impl CardinalityHints for ExecutionHistory {
  /// Row count of the most recent unfiltered, unlimited, executed
  /// single-dimension query.
  fn observed_cardinality(&self, model: &str, dimension: &str) -> Option<u64> {
    let records = self.lock();
    records
      .iter()
      .rev()
      .filter(|r| r.succeeded && !r.cache_hit && r.limit.is_none() && !r.filtered)
      .filter(|r| r.model == model && r.dimension_count == 1)
      .find(|r| r.first_dimension.as_deref() == Some(dimension))
      .and_then(|r| r.row_count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(dimension: &str) -> QueryRequest {
    QueryRequest::new("orders").dimension(dimension).measure("revenue")
  }

  #[tokio::test(start_paused = true)]
  async fn test_retention_by_count_and_age() {
    let history = ExecutionHistory::new(3, Duration::from_secs(60));
    for _ in 0..5 {
      history.record(ExecutionRecord::succeeded(&request("region"), Duration::ZERO, false, 4));
    }
    assert_eq!(history.len(), 3);

    tokio::time::advance(Duration::from_secs(61)).await;
    history.record(ExecutionRecord::succeeded(&request("region"), Duration::ZERO, false, 4));
    assert_eq!(history.len(), 1);
  }

  #[tokio::test]
  async fn test_insights_summarize_model_records() {
    let history = ExecutionHistory::new(100, Duration::from_secs(3_600));
    history.record(ExecutionRecord::succeeded(&request("region"), Duration::from_millis(100), false, 4));
    history.record(ExecutionRecord::succeeded(&request("region"), Duration::from_millis(1_500), false, 4));
    history.record(ExecutionRecord::succeeded(&request("region"), Duration::ZERO, true, 4));
    history.record(ExecutionRecord::failed(&request("month"), Duration::from_millis(400)));
    history.record(ExecutionRecord::succeeded(&QueryRequest::new("sessions").measure("sessions"), Duration::from_secs(9), false, 1));

    let insights = history.insights("orders", Duration::from_secs(1));

    assert_eq!(insights.query_count, 4);
    assert_eq!(insights.avg_latency, Duration::from_millis(2_000) / 3);
    assert!((insights.cache_hit_rate - 0.25).abs() < f64::EPSILON);
    assert_eq!(insights.slow_query_count, 1);
    assert_eq!(insights.failure_count, 1);
    assert_eq!(insights.suggestions.len(), 2);
  }

  #[tokio::test]
  async fn test_observed_cardinality_uses_latest_unlimited_execution() {
    let history = ExecutionHistory::new(100, Duration::from_secs(3_600));
    assert_eq!(history.observed_cardinality("orders", "region"), None);

    history.record(ExecutionRecord::succeeded(&request("region"), Duration::ZERO, false, 4));
    history.record(ExecutionRecord::succeeded(&request("region"), Duration::ZERO, false, 6));
    history.record(ExecutionRecord::succeeded(&request("region").limit(2), Duration::ZERO, false, 2));
    history.record(ExecutionRecord::succeeded(&request("region").dimension("month"), Duration::ZERO, false, 70));

    assert_eq!(history.observed_cardinality("orders", "region"), Some(6));
    assert_eq!(history.observed_cardinality("orders", "month"), None);
  }

  #[tokio::test]
  async fn test_filtered_lookups_do_not_teach_cardinality() {
    use crate::request::{Predicate, Scalar};

    let history = ExecutionHistory::new(100, Duration::from_secs(3_600));
    let lookup = request("customer_id").filter("customer_id", Predicate::Eq(Scalar::Int(42)));
    history.record(ExecutionRecord::succeeded(&lookup, Duration::ZERO, false, 1));
    assert_eq!(history.observed_cardinality("orders", "customer_id"), None);

    history.record(ExecutionRecord::succeeded(&request("customer_id"), Duration::ZERO, false, 900));
    history.record(ExecutionRecord::succeeded(&lookup, Duration::ZERO, false, 1));
    assert_eq!(history.observed_cardinality("orders", "customer_id"), Some(900));
  }
}
