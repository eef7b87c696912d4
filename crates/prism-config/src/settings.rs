use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable prefix for overrides, e.g. `PRISM__CACHE__CAPACITY=500`.
pub const ENV_PREFIX: &str = "PRISM";

/// Top-level runtime settings.
///
/// Every section falls back to its defaults, so a settings file only needs the
/// values it wants to change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub cache: CacheSettings,
  pub complexity: ComplexitySettings,
  pub optimizer: OptimizerSettings,
  pub engine: EngineSettings,
}

/// Result cache sizing and TTL bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  /// Maximum number of cached results.
  pub capacity: usize,
  /// TTL used when a caller does not supply one.
  pub default_ttl_secs: u64,
  /// TTL given to the cheapest queries.
  pub min_ttl_secs: u64,
  /// TTL given to the most complex queries.
  pub max_ttl_secs: u64,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      capacity: 1_000,
      default_ttl_secs: 300,
      min_ttl_secs: 60,
      max_ttl_secs: 3_600,
    }
  }
}

impl CacheSettings {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  pub fn min_ttl(&self) -> Duration {
    Duration::from_secs(self.min_ttl_secs)
  }

  pub fn max_ttl(&self) -> Duration {
    Duration::from_secs(self.max_ttl_secs)
  }
}

/// Admission thresholds and estimator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexitySettings {
  /// Requests scoring above this are rejected.
  pub max_complexity: u8,
  /// Requests estimated to return more rows than this are rejected.
  pub max_estimated_rows: u64,
  /// Cardinality assumed for dimensions with no declared or observed value.
  pub default_cardinality: u64,
  /// Dimension count at which an unlimited query gets a warning.
  pub wide_query_dimensions: usize,
}

impl Default for ComplexitySettings {
  fn default() -> Self {
    Self {
      max_complexity: 80,
      max_estimated_rows: 100_000,
      default_cardinality: 1_000,
      wide_query_dimensions: 4,
    }
  }
}

/// Query optimizer behaviour: history retention, timeouts, enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
  /// Maximum number of execution records kept.
  pub history_max_records: usize,
  /// Records older than this are dropped.
  pub history_max_age_secs: u64,
  /// Latency at which a query counts as slow.
  pub slow_query_ms: u64,
  /// Deadline for a single backend call.
  pub query_timeout_ms: u64,
  /// Backend calls allowed in flight at once.
  pub max_concurrent_queries: usize,
  /// How long a query waits for an admission slot before a capacity error.
  pub admission_timeout_ms: u64,
  /// Append usage-pattern suggestions to requests.
  pub enrichment_enabled: bool,
  /// Maximum number of fields enrichment may add to one request.
  pub max_enrichment: usize,
}

impl Default for OptimizerSettings {
  fn default() -> Self {
    Self {
      history_max_records: 10_000,
      history_max_age_secs: 86_400,
      slow_query_ms: 1_000,
      query_timeout_ms: 30_000,
      max_concurrent_queries: 64,
      admission_timeout_ms: 5_000,
      enrichment_enabled: true,
      max_enrichment: 2,
    }
  }
}

impl OptimizerSettings {
  pub fn history_max_age(&self) -> Duration {
    Duration::from_secs(self.history_max_age_secs)
  }

  pub fn slow_query_threshold(&self) -> Duration {
    Duration::from_millis(self.slow_query_ms)
  }

  pub fn query_timeout(&self) -> Duration {
    Duration::from_millis(self.query_timeout_ms)
  }

  pub fn admission_timeout(&self) -> Duration {
    Duration::from_millis(self.admission_timeout_ms)
  }
}

/// Workflow engine scheduling and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
  /// Steps running at once across all executions.
  pub worker_pool_size: usize,
  /// Steps a single execution may have in flight.
  pub max_parallel_steps: usize,
  /// Executions allowed to be pending or running at once.
  pub max_active_executions: usize,
  /// How long finished executions stay queryable.
  pub execution_retention_secs: u64,
  /// Deadline applied to steps that declare none.
  pub default_step_timeout_ms: Option<u64>,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      worker_pool_size: 8,
      max_parallel_steps: 4,
      max_active_executions: 32,
      execution_retention_secs: 3_600,
      default_step_timeout_ms: None,
    }
  }
}

impl EngineSettings {
  pub fn execution_retention(&self) -> Duration {
    Duration::from_secs(self.execution_retention_secs)
  }

  pub fn default_step_timeout(&self) -> Option<Duration> {
    self.default_step_timeout_ms.map(Duration::from_millis)
  }
}

impl Settings {
  /// Load settings from defaults, an optional file, and `PRISM__*` environment
  /// variables, in increasing order of precedence.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
      if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
      }
      builder = builder.add_source(File::from(path));
    }

    builder = builder.add_source(
      Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
  }

  /// Check cross-field invariants.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.cache.capacity == 0 {
      return Err(ConfigError::invalid("cache.capacity", "must be at least 1"));
    }
    if self.cache.min_ttl_secs > self.cache.max_ttl_secs {
      return Err(ConfigError::invalid(
        "cache.min_ttl_secs",
        "must not exceed cache.max_ttl_secs",
      ));
    }
    if self.complexity.max_complexity > 100 {
      return Err(ConfigError::invalid(
        "complexity.max_complexity",
        "scores are capped at 100",
      ));
    }
    if self.optimizer.max_concurrent_queries == 0 {
      return Err(ConfigError::invalid(
        "optimizer.max_concurrent_queries",
        "must be at least 1",
      ));
    }
    if self.engine.worker_pool_size == 0 {
      return Err(ConfigError::invalid("engine.worker_pool_size", "must be at least 1"));
    }
    if self.engine.max_parallel_steps == 0 {
      return Err(ConfigError::invalid(
        "engine.max_parallel_steps",
        "must be at least 1",
      ));
    }
    if self.engine.max_active_executions == 0 {
      return Err(ConfigError::invalid(
        "engine.max_active_executions",
        "must be at least 1",
      ));
    }
    Ok(())
  }
}
