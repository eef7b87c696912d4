//! Prism Query
//!
//! Everything between a caller's `QueryRequest` and the analytical backend:
//! - `ModelCatalog` validates requests against the known models
//! - `ComplexityEstimator` scores requests and gates admission
//! - `ResultCache` serves repeated requests until their TTL elapses
//! - `ExecutionHistory` records outcomes and feeds observed cardinalities back
//!   into estimation
//! - `QueryOptimizer` composes the above in front of a `QueryEngine`

mod backend;
mod batch;
mod cache;
mod complexity;
mod error;
mod history;
mod model;
mod optimizer;
mod request;

pub use backend::{QueryEngine, QueryResult, UsageContext};
pub use batch::{BatchSuggestion, batch_opportunities};
pub use cache::{CacheStats, EntryInfo, ResultCache};
pub use complexity::{
  CardinalityHints, ComplexityEstimator, ComplexityScore, ComplexityWarning, NoHints,
  RowEstimator, SqrtScaled,
};
pub use error::{BackendError, ErrorKind, ExceededLimit, QueryError};
pub use history::{ExecutionHistory, ExecutionRecord, PerformanceInsights};
pub use model::{
  Aggregation, DimensionDef, MeasureDef, ModelCatalog, ModelDefinition, ResolvedDimension,
};
pub use optimizer::{QueryOptimizer, QueryOutcome};
pub use request::{CacheKey, Predicate, QueryRequest, Scalar};
