//! Semantic model metadata used for validation and estimation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::request::QueryRequest;

/// How a measure aggregates its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
  Sum,
  Count,
  Avg,
  Min,
  Max,
  CountDistinct,
  /// An aggregate of a per-group aggregate, e.g. average lifetime value per customer.
  Nested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDef {
  pub name: String,
  /// Declared number of distinct values, if known.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cardinality: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureDef {
  pub name: String,
  pub aggregation: Aggregation,
  /// Source column, defaulting to the measure name.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub column: Option<String>,
}

impl MeasureDef {
  pub fn column(&self) -> &str {
    self.column.as_deref().unwrap_or(&self.name)
  }
}

/// A named data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub dimensions: Vec<DimensionDef>,
  #[serde(default)]
  pub measures: Vec<MeasureDef>,
  /// Large fact tables that should always be filtered.
  #[serde(default)]
  pub high_volume: bool,
}

impl ModelDefinition {
  pub fn dimension(&self, name: &str) -> Option<&DimensionDef> {
    self.dimensions.iter().find(|d| d.name == name)
  }

  pub fn measure(&self, name: &str) -> Option<&MeasureDef> {
    self.measures.iter().find(|m| m.name == name)
  }
}

/// The set of models queries may target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
  models: BTreeMap<String, ModelDefinition>,
}

/// A dimension reference resolved against the catalog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedDimension<'a> {
  /// Model that owns the dimension.
  pub model: &'a ModelDefinition,
  pub def: &'a DimensionDef,
  /// Whether the dimension lives on another model (implies a join).
  pub foreign: bool,
}

impl ModelCatalog {
  pub fn new(models: impl IntoIterator<Item = ModelDefinition>) -> Self {
    Self {
      models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
    }
  }

  pub fn get(&self, name: &str) -> Option<&ModelDefinition> {
    self.models.get(name)
  }

  pub fn models(&self) -> impl Iterator<Item = &ModelDefinition> {
    self.models.values()
  }

  pub fn len(&self) -> usize {
    self.models.len()
  }

  pub fn is_empty(&self) -> bool {
    self.models.is_empty()
  }

  /// Resolve a dimension name used in a query on `model`.
  ///
  /// Plain names resolve on the model itself, `other.dimension` resolves on
  /// `other` and counts as a cross-model reference.
  pub fn resolve_dimension<'a>(
    &'a self,
    model: &'a ModelDefinition,
    name: &str,
  ) -> Option<ResolvedDimension<'a>> {
    if let Some(def) = model.dimension(name) {
      return Some(ResolvedDimension {
        model,
        def,
        foreign: false,
      });
    }

    let (owner, field) = name.split_once('.')?;
    let owner_model = self.models.get(owner)?;
    let def = owner_model.dimension(field)?;
    Some(ResolvedDimension {
      model: owner_model,
      def,
      foreign: owner != model.name,
    })
  }

  /// Check that the request only references known names.
  pub fn validate(&self, request: &QueryRequest) -> Result<&ModelDefinition, QueryError> {
    let model = self
      .models
      .get(&request.model)
      .ok_or_else(|| QueryError::UnknownModel {
        model: request.model.clone(),
      })?;

    if request.dimensions.is_empty() && request.measures.is_empty() {
      return Err(QueryError::InvalidRequest {
        message: "request must name at least one dimension or measure".to_string(),
      });
    }

    for dimension in &request.dimensions {
      if self.resolve_dimension(model, dimension).is_none() {
        return Err(QueryError::UnknownField {
          model: model.name.clone(),
          kind: "dimension",
          field: dimension.clone(),
        });
      }
    }

    for measure in &request.measures {
      if model.measure(measure).is_none() {
        return Err(QueryError::UnknownField {
          model: model.name.clone(),
          kind: "measure",
          field: measure.clone(),
        });
      }
    }

    for key in request.filters.keys() {
      if self.resolve_dimension(model, key).is_none() && model.measure(key).is_none() {
        return Err(QueryError::UnknownField {
          model: model.name.clone(),
          kind: "filter",
          field: key.clone(),
        });
      }
    }

    if request.limit == Some(0) {
      return Err(QueryError::InvalidRequest {
        message: "limit must be greater than zero".to_string(),
      });
    }

    Ok(model)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::request::{Predicate, Scalar};

  pub(crate) fn retail_catalog() -> ModelCatalog {
    ModelCatalog::new([
      ModelDefinition {
        name: "orders".to_string(),
        description: "Order facts".to_string(),
        dimensions: vec![
          DimensionDef {
            name: "region".to_string(),
            cardinality: Some(4),
          },
          DimensionDef {
            name: "channel".to_string(),
            cardinality: Some(3),
          },
          DimensionDef {
            name: "month".to_string(),
            cardinality: Some(12),
          },
          DimensionDef {
            name: "order_id".to_string(),
            cardinality: Some(500_000),
          },
          DimensionDef {
            name: "product".to_string(),
            cardinality: None,
          },
        ],
        measures: vec![
          MeasureDef {
            name: "revenue".to_string(),
            aggregation: Aggregation::Sum,
            column: None,
          },
          MeasureDef {
            name: "order_count".to_string(),
            aggregation: Aggregation::Count,
            column: None,
          },
          MeasureDef {
            name: "unique_customers".to_string(),
            aggregation: Aggregation::CountDistinct,
            column: Some("customer_id".to_string()),
          },
          MeasureDef {
            name: "avg_customer_ltv".to_string(),
            aggregation: Aggregation::Nested,
            column: Some("customer_ltv".to_string()),
          },
        ],
        high_volume: true,
      },
      ModelDefinition {
        name: "customers".to_string(),
        description: String::new(),
        dimensions: vec![
          DimensionDef {
            name: "segment".to_string(),
            cardinality: Some(5),
          },
          DimensionDef {
            name: "region".to_string(),
            cardinality: Some(4),
          },
        ],
        measures: vec![MeasureDef {
          name: "customer_count".to_string(),
          aggregation: Aggregation::Count,
          column: None,
        }],
        high_volume: false,
      },
      ModelDefinition {
        name: "stores".to_string(),
        description: String::new(),
        dimensions: vec![DimensionDef {
          name: "format".to_string(),
          cardinality: Some(3),
        }],
        measures: vec![],
        high_volume: false,
      },
    ])
  }

  #[test]
  fn test_validate_accepts_known_fields() {
    let catalog = retail_catalog();
    let request = QueryRequest::new("orders")
      .dimensions(["region", "customers.segment"])
      .measure("revenue")
      .filter("revenue", Predicate::Gt(10.0));
    assert!(catalog.validate(&request).is_ok());
  }

  #[test]
  fn test_validate_rejects_unknown_names() {
    let catalog = retail_catalog();

    let err = catalog
      .validate(&QueryRequest::new("nope").measure("revenue"))
      .unwrap_err();
    assert!(matches!(err, QueryError::UnknownModel { .. }));

    let err = catalog
      .validate(&QueryRequest::new("orders").dimension("colour"))
      .unwrap_err();
    assert!(matches!(err, QueryError::UnknownField { kind: "dimension", .. }));

    let err = catalog
      .validate(&QueryRequest::new("orders").measure("profit"))
      .unwrap_err();
    assert!(matches!(err, QueryError::UnknownField { kind: "measure", .. }));

    let err = catalog
      .validate(
        &QueryRequest::new("orders")
          .measure("revenue")
          .filter("colour", Predicate::Eq(Scalar::Str("red".into()))),
      )
      .unwrap_err();
    assert!(matches!(err, QueryError::UnknownField { kind: "filter", .. }));
  }

  #[test]
  fn test_validate_rejects_empty_request() {
    let catalog = retail_catalog();
    let err = catalog.validate(&QueryRequest::new("orders")).unwrap_err();
    assert!(matches!(err, QueryError::InvalidRequest { .. }));
  }

  #[test]
  fn test_resolve_foreign_dimension() {
    let catalog = retail_catalog();
    let orders = catalog.get("orders").unwrap();

    let local = catalog.resolve_dimension(orders, "region").unwrap();
    assert!(!local.foreign);

    let foreign = catalog.resolve_dimension(orders, "customers.segment").unwrap();
    assert!(foreign.foreign);
    assert_eq!(foreign.model.name, "customers");
    assert_eq!(foreign.def.cardinality, Some(5));

    assert!(catalog.resolve_dimension(orders, "customers.colour").is_none());
  }
}
