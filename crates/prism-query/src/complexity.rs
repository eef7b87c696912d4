//! Query complexity scoring and row estimation.
//!
//! Scoring is a pure function of the request, the model catalog and whatever
//! cardinality hints the caller supplies. It drives admission control in the
//! optimizer; warnings are advisory and never block a query.

use std::collections::BTreeSet;
use std::fmt;

use prism_config::ComplexitySettings;
use serde::Serialize;

use crate::error::ExceededLimit;
use crate::model::{Aggregation, ModelCatalog};
use crate::request::QueryRequest;

const BASE_SCORE: u32 = 10;
const PER_DIMENSION: u32 = 5;
const PER_MEASURE: u32 = 3;
const PER_JOIN: u32 = 10;
const PER_NESTED_MEASURE: u32 = 15;
const DISTINCT_COUNT: u32 = 5;
const MEASURE_FILTER: u32 = 8;
const MAX_SCORE: u32 = 100;

/// Source of observed dimension cardinalities.
pub trait CardinalityHints: Send + Sync {
  /// Distinct values previously observed for `dimension` on `model`, if any.
  fn observed_cardinality(&self, model: &str, dimension: &str) -> Option<u64>;
}

/// Hints that know nothing; estimation falls back to declared cardinalities.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHints;

impl CardinalityHints for NoHints {
  fn observed_cardinality(&self, _model: &str, _dimension: &str) -> Option<u64> {
    None
  }
}

/// Strategy turning the first dimension's cardinality into a row estimate.
pub trait RowEstimator: Send + Sync {
  fn estimate(&self, first_cardinality: u64, dimension_count: usize) -> u64;
}

/// Scales the first dimension's cardinality by the square root of the number of
/// dimensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqrtScaled;

impl RowEstimator for SqrtScaled {
  fn estimate(&self, first_cardinality: u64, dimension_count: usize) -> u64 {
    let scaled = first_cardinality as f64 * (dimension_count.max(1) as f64).sqrt();
    if scaled >= u64::MAX as f64 {
      u64::MAX
    } else {
      scaled.ceil() as u64
    }
  }
}

/// Advisory findings attached to a score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ComplexityWarning {
  /// A high-volume model queried without any filter.
  UnfilteredHighVolume { model: String },
  /// Many dimensions and no row limit.
  WideUnlimited { dimensions: usize },
  /// Several joins and no filter to restrict them.
  PossibleCrossProduct { joins: usize },
}

impl fmt::Display for ComplexityWarning {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ComplexityWarning::UnfilteredHighVolume { model } => {
        write!(f, "no filter on high-volume model '{}'", model)
      }
      ComplexityWarning::WideUnlimited { dimensions } => {
        write!(f, "{} dimensions without a row limit", dimensions)
      }
      ComplexityWarning::PossibleCrossProduct { joins } => {
        write!(f, "{} joins without filters may produce a cross product", joins)
      }
    }
  }
}

/// Result of scoring one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplexityScore {
  /// 0..=100.
  pub complexity: u8,
  pub estimated_rows: u64,
  /// Distinct foreign models the request reaches.
  pub joins: usize,
  pub warnings: Vec<ComplexityWarning>,
}

/// Scores requests and checks them against the admission thresholds.
pub struct ComplexityEstimator {
  settings: ComplexitySettings,
  rows: Box<dyn RowEstimator>,
}

impl ComplexityEstimator {
  pub fn new(settings: ComplexitySettings) -> Self {
    Self {
      settings,
      rows: Box::new(SqrtScaled),
    }
  }

  /// Replace the row estimation strategy.
  pub fn with_row_estimator(mut self, rows: impl RowEstimator + 'static) -> Self {
    self.rows = Box::new(rows);
    self
  }

  pub fn settings(&self) -> &ComplexitySettings {
    &self.settings
  }

  /// Score a request.
  ///
  /// Names the catalog does not know contribute their base weight only; callers
  /// validate requests before scoring them.
  pub fn score(
    &self,
    catalog: &ModelCatalog,
    request: &QueryRequest,
    hints: &dyn CardinalityHints,
  ) -> ComplexityScore {
    let model = catalog.get(&request.model);

    let foreign: BTreeSet<&str> = match model {
      Some(model) => request
        .dimensions
        .iter()
        .chain(request.filters.keys())
        .filter_map(|name| catalog.resolve_dimension(model, name))
        .filter(|resolved| resolved.foreign)
        .map(|resolved| resolved.model.name.as_str())
        .collect(),
      None => BTreeSet::new(),
    };
    let joins = foreign.len();

    let aggregations: Vec<Aggregation> = match model {
      Some(model) => request
        .measures
        .iter()
        .filter_map(|name| model.measure(name))
        .map(|m| m.aggregation)
        .collect(),
      None => Vec::new(),
    };
    let nested = aggregations
      .iter()
      .filter(|a| **a == Aggregation::Nested)
      .count();
    let has_distinct = aggregations.contains(&Aggregation::CountDistinct);
    let has_measure_filter = model.is_some_and(|model| {
      request
        .filters
        .keys()
        .any(|key| model.dimension(key).is_none() && model.measure(key).is_some())
    });

    let mut score = BASE_SCORE
      + PER_DIMENSION * request.dimensions.len() as u32
      + PER_MEASURE * request.measures.len() as u32
      + PER_JOIN * joins as u32
      + PER_NESTED_MEASURE * nested as u32;
    if has_distinct {
      score += DISTINCT_COUNT;
    }
    if has_measure_filter {
      score += MEASURE_FILTER;
    }
    let complexity = score.min(MAX_SCORE) as u8;

    let estimated_rows = self.estimate_rows(catalog, request, hints);

    let mut warnings = Vec::new();
    if request.filters.is_empty() && model.is_some_and(|m| m.high_volume) {
      warnings.push(ComplexityWarning::UnfilteredHighVolume {
        model: request.model.clone(),
      });
    }
    if request.dimensions.len() >= self.settings.wide_query_dimensions && request.limit.is_none() {
      warnings.push(ComplexityWarning::WideUnlimited {
        dimensions: request.dimensions.len(),
      });
    }
    if joins >= 2 && request.filters.is_empty() {
      warnings.push(ComplexityWarning::PossibleCrossProduct { joins });
    }

    ComplexityScore {
      complexity,
      estimated_rows,
      joins,
      warnings,
    }
  }

  fn estimate_rows(
    &self,
    catalog: &ModelCatalog,
    request: &QueryRequest,
    hints: &dyn CardinalityHints,
  ) -> u64 {
    let Some(first) = request.dimensions.first() else {
      return 1;
    };

    let cardinality = hints
      .observed_cardinality(&request.model, first)
      .or_else(|| {
        let model = catalog.get(&request.model)?;
        catalog.resolve_dimension(model, first)?.def.cardinality
      })
      .unwrap_or(self.settings.default_cardinality);

    let estimate = self.rows.estimate(cardinality, request.dimensions.len());
    match request.limit {
      Some(limit) => estimate.min(limit),
      None => estimate,
    }
  }

  /// The first threshold the score exceeds, if any.
  pub fn check(&self, score: &ComplexityScore) -> Result<(), ExceededLimit> {
    if score.complexity > self.settings.max_complexity {
      return Err(ExceededLimit::Complexity {
        score: score.complexity,
        max: self.settings.max_complexity,
      });
    }
    if score.estimated_rows > self.settings.max_estimated_rows {
      return Err(ExceededLimit::EstimatedRows {
        estimate: score.estimated_rows,
        max: self.settings.max_estimated_rows,
      });
    }
    Ok(())
  }
}
