//! Query requests and their canonical cache keys.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

/// A scalar filter operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
}

impl Scalar {
  /// Numeric view of the scalar, if it has one.
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Scalar::Int(i) => Some(*i as f64),
      Scalar::Float(f) => Some(*f),
      _ => None,
    }
  }

  /// Compare against a JSON value from a result row.
  pub fn matches(&self, value: &serde_json::Value) -> bool {
    match (self, value) {
      (Scalar::Bool(a), serde_json::Value::Bool(b)) => a == b,
      (Scalar::Str(a), serde_json::Value::String(b)) => a == b,
      (Scalar::Int(a), serde_json::Value::Number(n)) if n.is_i64() || n.is_u64() => {
        n.as_i64() == Some(*a)
      }
      (Scalar::Int(_) | Scalar::Float(_), serde_json::Value::Number(n)) => {
        match (self.as_f64(), n.as_f64()) {
          (Some(a), Some(b)) => a == b,
          _ => false,
        }
      }
      _ => false,
    }
  }

  fn canonical(&self) -> String {
    match self {
      Scalar::Bool(b) => format!("b:{}", b),
      Scalar::Int(i) => format!("n:{}", i),
      // Integral floats share the integer form so `3` and `3.0` hash alike.
      Scalar::Float(f) => match exact_integer(*f) {
        Some(i) => format!("n:{}", i),
        None => format!("n:{}", f),
      },
      Scalar::Str(s) => format!("s:{}", s),
    }
  }
}

impl fmt::Display for Scalar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Scalar::Bool(b) => write!(f, "{}", b),
      Scalar::Int(i) => write!(f, "{}", i),
      Scalar::Float(x) => write!(f, "{}", x),
      Scalar::Str(s) => write!(f, "{}", s),
    }
  }
}

fn exact_integer(f: f64) -> Option<i64> {
  // i64::MAX as f64 rounds up to 2^63, which does not fit.
  if f.fract() != 0.0 || f < i64::MIN as f64 || f >= i64::MAX as f64 {
    return None;
  }
  let i = f as i64;
  (i as f64 == f).then_some(i)
}

/// A filter predicate applied to one dimension or measure.
///
/// Serialized externally tagged: `{"eq": "EU"}`, `{"in": ["EU", "NA"]}`, `{"gte": 10}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
  Eq(Scalar),
  Ne(Scalar),
  In(Vec<Scalar>),
  Gt(f64),
  Gte(f64),
  Lt(f64),
  Lte(f64),
}

impl Predicate {
  /// Evaluate the predicate against a row value.
  pub fn evaluate(&self, value: &serde_json::Value) -> bool {
    match self {
      Predicate::Eq(s) => s.matches(value),
      Predicate::Ne(s) => !s.matches(value),
      Predicate::In(set) => set.iter().any(|s| s.matches(value)),
      Predicate::Gt(n) => value.as_f64().is_some_and(|v| v > *n),
      Predicate::Gte(n) => value.as_f64().is_some_and(|v| v >= *n),
      Predicate::Lt(n) => value.as_f64().is_some_and(|v| v < *n),
      Predicate::Lte(n) => value.as_f64().is_some_and(|v| v <= *n),
    }
  }

  /// Order-independent form used for hashing.
  fn canonical(&self) -> serde_json::Value {
    match self {
      Predicate::Eq(s) => json!({ "eq": s.canonical() }),
      Predicate::Ne(s) => json!({ "ne": s.canonical() }),
      Predicate::In(set) => {
        let mut items: Vec<String> = set.iter().map(Scalar::canonical).collect();
        items.sort();
        items.dedup();
        json!({ "in": items })
      }
      Predicate::Gt(n) => json!({ "gt": n }),
      Predicate::Gte(n) => json!({ "gte": n }),
      Predicate::Lt(n) => json!({ "lt": n }),
      Predicate::Lte(n) => json!({ "lte": n }),
    }
  }
}

/// A parametric query against one named model.
///
/// Dimensions and measures behave as ordered sets: duplicates are dropped on
/// construction and equality ignores their order. The first dimension still
/// matters to the row estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
  pub model: String,
  #[serde(default)]
  pub dimensions: Vec<String>,
  #[serde(default)]
  pub measures: Vec<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub filters: BTreeMap<String, Predicate>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub limit: Option<u64>,
}

impl QueryRequest {
  pub fn new(model: impl Into<String>) -> Self {
    Self {
      model: model.into(),
      dimensions: Vec::new(),
      measures: Vec::new(),
      filters: BTreeMap::new(),
      limit: None,
    }
  }

  pub fn dimension(mut self, name: impl Into<String>) -> Self {
    push_unique(&mut self.dimensions, name.into());
    self
  }

  pub fn dimensions<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    for name in names {
      push_unique(&mut self.dimensions, name.into());
    }
    self
  }

  pub fn measure(mut self, name: impl Into<String>) -> Self {
    push_unique(&mut self.measures, name.into());
    self
  }

  pub fn measures<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    for name in names {
      push_unique(&mut self.measures, name.into());
    }
    self
  }

  pub fn filter(mut self, key: impl Into<String>, predicate: Predicate) -> Self {
    self.filters.insert(key.into(), predicate);
    self
  }

  pub fn limit(mut self, limit: u64) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Drop duplicate dimensions and measures, keeping first occurrences.
  ///
  /// Requests built through the builder are already normalized; this is for
  /// requests deserialized from user input.
  pub fn normalized(mut self) -> Self {
    self.dimensions = dedup_preserving_order(self.dimensions);
    self.measures = dedup_preserving_order(self.measures);
    self
  }

  /// Canonical form of the filters alone.
  pub(crate) fn filter_key(&self) -> String {
    self.canonical_filters().to_string()
  }

  fn canonical_filters(&self) -> serde_json::Value {
    self
      .filters
      .iter()
      .map(|(k, p)| (k.clone(), p.canonical()))
      .collect::<serde_json::Map<_, _>>()
      .into()
  }

  /// Order-independent canonical form: compact JSON with sorted names.
  pub fn canonical_form(&self) -> String {
    let mut dimensions = self.dimensions.clone();
    dimensions.sort();
    dimensions.dedup();
    let mut measures = self.measures.clone();
    measures.sort();
    measures.dedup();
    json!({
      "model": self.model,
      "dimensions": dimensions,
      "measures": measures,
      "filters": self.canonical_filters(),
      "limit": self.limit,
    })
    .to_string()
  }

  /// The deterministic cache key for this request.
  pub fn cache_key(&self) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical_form().as_bytes());
    CacheKey {
      model: self.model.clone(),
      digest: format!("{:x}", hasher.finalize()),
    }
  }
}

impl PartialEq for QueryRequest {
  fn eq(&self, other: &Self) -> bool {
    self.canonical_form() == other.canonical_form()
  }
}

impl Eq for QueryRequest {}

impl Hash for QueryRequest {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical_form().hash(state);
  }
}

fn push_unique(list: &mut Vec<String>, name: String) {
  if !list.contains(&name) {
    list.push(name);
  }
}

fn dedup_preserving_order(list: Vec<String>) -> Vec<String> {
  let mut out = Vec::with_capacity(list.len());
  for name in list {
    push_unique(&mut out, name);
  }
  out
}

/// Cache key: SHA-256 of a request's canonical form, tagged with its model.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CacheKey {
  model: String,
  digest: String,
}

impl CacheKey {
  pub fn model(&self) -> &str {
    &self.model
  }

  /// Hex digest of the canonical request.
  pub fn digest(&self) -> &str {
    &self.digest
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.model, &self.digest[..12.min(self.digest.len())])
  }
}
