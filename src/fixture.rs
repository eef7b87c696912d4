//! In-memory JSON dataset serving as the query backend and usage provider.
//!
//! A dataset file holds model definitions, raw rows per model and optional
//! usage patterns:
//! ```json
//! {
//!   "models": [ { "name": "orders", "dimensions": [...], "measures": [...] } ],
//!   "rows": { "orders": [ { "region": "EU", "revenue": 120.0 } ] },
//!   "usage": { "orders": ["order_count"] }
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use prism_query::{
  Aggregation, BackendError, MeasureDef, ModelCatalog, ModelDefinition, QueryEngine, QueryRequest,
  QueryResult, UsageContext,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::time::Instant;

/// The retail demo bundled into the binary.
const DEMO_DATASET: &str = include_str!("../demos/retail.json");

type Row = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
  #[error("failed to read dataset {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse dataset {origin}: {source}")]
  Parse {
    origin: String,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Debug, Deserialize)]
pub struct Dataset {
  pub models: Vec<ModelDefinition>,
  #[serde(default)]
  pub rows: HashMap<String, Vec<Row>>,
  #[serde(default)]
  pub usage: HashMap<String, Vec<String>>,
}

impl Dataset {
  /// Read a dataset file, or the bundled demo when no path is given.
  pub fn load(path: Option<&Path>) -> Result<Self, DatasetError> {
    let (content, origin) = match path {
      Some(path) => (
        std::fs::read_to_string(path).map_err(|source| DatasetError::Read {
          path: path.to_path_buf(),
          source,
        })?,
        path.display().to_string(),
      ),
      None => (DEMO_DATASET.to_string(), "bundled demo".to_string()),
    };
    serde_json::from_str(&content).map_err(|source| DatasetError::Parse { origin, source })
  }

  pub fn catalog(&self) -> ModelCatalog {
    ModelCatalog::new(self.models.iter().cloned())
  }

  /// Split into the backend and the usage provider.
  pub fn into_parts(self) -> (FixtureEngine, FixtureUsage) {
    let catalog = self.catalog();
    (
      FixtureEngine {
        catalog,
        rows: self.rows,
      },
      FixtureUsage { usage: self.usage },
    )
  }
}

/// Group-by engine over the dataset rows.
pub struct FixtureEngine {
  catalog: ModelCatalog,
  rows: HashMap<String, Vec<Row>>,
}

#[async_trait]
impl QueryEngine for FixtureEngine {
  async fn execute(&self, request: &QueryRequest) -> Result<QueryResult, BackendError> {
    let started = Instant::now();
    let model = self
      .catalog
      .get(&request.model)
      .ok_or_else(|| BackendError::new(format!("no data for model '{}'", request.model)))?;
    let source = self
      .rows
      .get(&model.name)
      .map(Vec::as_slice)
      .unwrap_or_default();

    // Measure filters apply to aggregated rows, everything else to raw rows.
    let (having, filters): (Vec<_>, Vec<_>) = request
      .filters
      .iter()
      .partition(|(key, _)| model.measure(key).is_some());

    let mut groups: BTreeMap<String, (Vec<Value>, Vec<&Row>)> = BTreeMap::new();
    for row in source {
      if !filters.iter().all(|(key, p)| p.evaluate(field(row, key))) {
        continue;
      }
      let values: Vec<Value> = request
        .dimensions
        .iter()
        .map(|d| field(row, d).clone())
        .collect();
      let key = Value::Array(values.clone()).to_string();
      groups.entry(key).or_insert_with(|| (values, Vec::new())).1.push(row);
    }

    let mut measures = Vec::with_capacity(request.measures.len());
    for name in &request.measures {
      let def = model
        .measure(name)
        .ok_or_else(|| BackendError::new(format!("unknown measure '{}'", name)))?;
      measures.push(def);
    }

    let limit = request.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    let rows: Vec<Row> = groups
      .into_values()
      .map(|(values, members)| {
        let mut out = Map::new();
        for (dimension, value) in request.dimensions.iter().zip(values) {
          out.insert(dimension.clone(), value);
        }
        for def in &measures {
          out.insert(def.name.clone(), aggregate(def, &members));
        }
        out
      })
      .filter(|row| having.iter().all(|(key, p)| p.evaluate(field(row, key))))
      .take(limit)
      .collect();

    Ok(QueryResult {
      columns: request
        .dimensions
        .iter()
        .chain(&request.measures)
        .cloned()
        .collect(),
      rows,
      duration: started.elapsed(),
    })
  }
}

static NULL: Value = Value::Null;

/// Look up a column; `other.field` falls back to `field`.
fn field<'a>(row: &'a Row, name: &str) -> &'a Value {
  row
    .get(name)
    .or_else(|| name.split_once('.').and_then(|(_, f)| row.get(f)))
    .unwrap_or(&NULL)
}

fn aggregate(def: &MeasureDef, rows: &[&Row]) -> Value {
  let column = def.column();
  let numbers: Vec<f64> = rows
    .iter()
    .filter_map(|r| r.get(column).and_then(Value::as_f64))
    .collect();

  match def.aggregation {
    Aggregation::Sum => json!(round(numbers.iter().sum())),
    Aggregation::Count => json!(rows.len()),
    // Rows are already one per entity, so a nested aggregate is their mean.
    Aggregation::Avg | Aggregation::Nested => {
      if numbers.is_empty() {
        Value::Null
      } else {
        json!(round(numbers.iter().sum::<f64>() / numbers.len() as f64))
      }
    }
    Aggregation::Min => numbers
      .iter()
      .copied()
      .reduce(f64::min)
      .map_or(Value::Null, |v| json!(v)),
    Aggregation::Max => numbers
      .iter()
      .copied()
      .reduce(f64::max)
      .map_or(Value::Null, |v| json!(v)),
    Aggregation::CountDistinct => {
      let distinct: HashSet<String> = rows
        .iter()
        .filter_map(|r| r.get(column))
        .filter(|v| !v.is_null())
        .map(Value::to_string)
        .collect();
      json!(distinct.len())
    }
  }
}

fn round(value: f64) -> f64 {
  (value * 100.0).round() / 100.0
}

/// Usage patterns declared in the dataset.
pub struct FixtureUsage {
  usage: HashMap<String, Vec<String>>,
}

#[async_trait]
impl UsageContext for FixtureUsage {
  async fn recent_dimensions_measures(&self, model: &str) -> Result<Vec<String>, BackendError> {
    Ok(self.usage.get(model).cloned().unwrap_or_default())
  }
}
