//! Built-in derived analysis over query-step outputs.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use prism_workflow::{DerivedOperation, StepDefinition, StepKind};
use serde_json::{Map, Value, json};

use crate::error::StepError;
use crate::executor::{StepContext, StepExecutor};

type Row = Map<String, Value>;

/// Executes `derived_analysis` steps. Pure: output depends only on inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivedAnalysisExecutor;

#[async_trait]
impl StepExecutor for DerivedAnalysisExecutor {
  async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
    let StepKind::DerivedAnalysis(operation) = &ctx.step.kind else {
      return Err(StepError::input("not a derived analysis step"));
    };

    match operation {
      DerivedOperation::PercentChange {
        baseline,
        current,
        measure,
        key,
      } => {
        let before = rows(ctx.require_input(baseline)?, baseline)?;
        let after = rows(ctx.require_input(current)?, current)?;
        percent_change(before, after, measure, key, baseline, current)
      }
      DerivedOperation::Share { source, measure } => {
        share(rows(ctx.require_input(source)?, source)?, measure, source)
      }
      DerivedOperation::TopN { source, measure, n } => {
        top_n(rows(ctx.require_input(source)?, source)?, measure, *n, source)
      }
    }
  }

  fn validate(&self, step: &StepDefinition) -> Result<(), String> {
    match &step.kind {
      StepKind::DerivedAnalysis(DerivedOperation::TopN { n: 0, .. }) => {
        Err("top_n needs n of at least 1".to_string())
      }
      StepKind::DerivedAnalysis(DerivedOperation::PercentChange {
        baseline, current, ..
      }) if baseline == current => Err("baseline and current must be different steps".to_string()),
      StepKind::DerivedAnalysis(_) => Ok(()),
      _ => Err("not a derived analysis step".to_string()),
    }
  }
}

fn rows<'a>(output: &'a Value, step_id: &str) -> Result<Vec<&'a Row>, StepError> {
  let array = output
    .get("rows")
    .and_then(Value::as_array)
    .ok_or_else(|| StepError::invalid_input(step_id, "output has no 'rows' array"))?;
  array
    .iter()
    .map(|row| {
      row
        .as_object()
        .ok_or_else(|| StepError::invalid_input(step_id, "row is not an object"))
    })
    .collect()
}

fn number(row: &Row, measure: &str, step_id: &str) -> Result<f64, StepError> {
  row
    .get(measure)
    .and_then(Value::as_f64)
    .ok_or_else(|| StepError::invalid_input(step_id, format!("row has no numeric '{}'", measure)))
}

fn key_of(row: &Row, key: &str, step_id: &str) -> Result<String, StepError> {
  match row.get(key) {
    Some(Value::String(s)) => Ok(s.clone()),
    Some(Value::Null) | None => Err(StepError::invalid_input(
      step_id,
      format!("row has no '{}' key", key),
    )),
    Some(other) => Ok(other.to_string()),
  }
}

fn percent_change(
  before: Vec<&Row>,
  after: Vec<&Row>,
  measure: &str,
  key: &str,
  baseline_id: &str,
  current_id: &str,
) -> Result<Value, StepError> {
  let mut joined: BTreeMap<String, (Value, Option<f64>, Option<f64>)> = BTreeMap::new();
  for row in before {
    let entry = joined
      .entry(key_of(row, key, baseline_id)?)
      .or_insert((row[key].clone(), None, None));
    entry.1 = Some(number(row, measure, baseline_id)?);
  }
  for row in after {
    let entry = joined
      .entry(key_of(row, key, current_id)?)
      .or_insert((row[key].clone(), None, None));
    entry.2 = Some(number(row, measure, current_id)?);
  }

  let rows: Vec<Value> = joined
    .into_values()
    .map(|(key_value, baseline, current)| {
      let change = match (baseline, current) {
        (Some(b), Some(c)) if b != 0.0 => json!((c - b) / b.abs() * 100.0),
        _ => Value::Null,
      };
      json!({
        key: key_value,
        "baseline": baseline,
        "current": current,
        "percent_change": change,
      })
    })
    .collect();

  Ok(json!({
    "operation": "percent_change",
    "measure": measure,
    "rows": rows,
  }))
}

fn share(source: Vec<&Row>, measure: &str, source_id: &str) -> Result<Value, StepError> {
  let values = source
    .iter()
    .map(|row| number(row, measure, source_id))
    .collect::<Result<Vec<f64>, _>>()?;
  let total: f64 = values.iter().sum();

  let rows: Vec<Value> = source
    .into_iter()
    .zip(values)
    .map(|(row, value)| {
      let mut row = row.clone();
      let share = if total == 0.0 {
        Value::Null
      } else {
        json!(value / total)
      };
      row.insert("share".to_string(), share);
      Value::Object(row)
    })
    .collect();

  Ok(json!({
    "operation": "share",
    "measure": measure,
    "total": total,
    "rows": rows,
  }))
}

fn top_n(source: Vec<&Row>, measure: &str, n: usize, source_id: &str) -> Result<Value, StepError> {
  let mut ranked = source
    .into_iter()
    .map(|row| Ok((number(row, measure, source_id)?, row)))
    .collect::<Result<Vec<(f64, &Row)>, StepError>>()?;
  // Stable: ties keep source order.
  ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

  let rows: Vec<Value> = ranked
    .into_iter()
    .take(n)
    .map(|(_, row)| Value::Object(row.clone()))
    .collect();

  Ok(json!({
    "operation": "top_n",
    "measure": measure,
    "rows": rows,
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use crate::execution::StartParams;
  use crate::executor::StepInput;
  use tokio_util::sync::CancellationToken;

  fn ctx(operation: DerivedOperation, inputs: Vec<(&str, Value)>) -> StepContext {
    StepContext {
      execution_id: "exec".to_string(),
      step: StepDefinition::new("derived", StepKind::DerivedAnalysis(operation)),
      inputs: inputs
        .into_iter()
        .map(|(id, output)| StepInput {
          step_id: id.to_string(),
          output,
        })
        .collect(),
      params: Arc::new(StartParams::default()),
      cancel: CancellationToken::new(),
    }
  }

  fn by_region(values: &[(&str, f64)]) -> Value {
    let rows: Vec<Value> = values
      .iter()
      .map(|(region, revenue)| json!({ "region": region, "revenue": revenue }))
      .collect();
    json!({ "rows": rows })
  }

  #[tokio::test]
  async fn test_percent_change_joins_on_key() {
    let ctx = ctx(
      DerivedOperation::PercentChange {
        baseline: "prev".to_string(),
        current: "curr".to_string(),
        measure: "revenue".to_string(),
        key: "region".to_string(),
      },
      vec![
        ("curr", by_region(&[("EU", 150.0), ("NA", 90.0), ("APAC", 10.0)])),
        ("prev", by_region(&[("EU", 100.0), ("NA", 100.0), ("LATAM", 5.0)])),
      ],
    );

    let output = DerivedAnalysisExecutor.execute(&ctx).await.unwrap();
    let rows = output["rows"].as_array().unwrap();

    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0]["region"], "APAC");
    assert_eq!(rows[0]["percent_change"], Value::Null);
    assert_eq!(rows[1]["region"], "EU");
    assert_eq!(rows[1]["percent_change"], json!(50.0));
    assert_eq!(rows[3]["region"], "NA");
    assert_eq!(rows[3]["percent_change"], json!(-10.0));
  }

  #[tokio::test]
  async fn test_share_and_top_n() {
    let input = by_region(&[("EU", 30.0), ("NA", 50.0), ("APAC", 20.0)]);

    let share_ctx = ctx(
      DerivedOperation::Share {
        source: "q".to_string(),
        measure: "revenue".to_string(),
      },
      vec![("q", input.clone())],
    );
    let output = DerivedAnalysisExecutor.execute(&share_ctx).await.unwrap();
    assert_eq!(output["total"], json!(100.0));
    assert_eq!(output["rows"][1]["share"], json!(0.5));

    let top_ctx = ctx(
      DerivedOperation::TopN {
        source: "q".to_string(),
        measure: "revenue".to_string(),
        n: 2,
      },
      vec![("q", input)],
    );
    let output = DerivedAnalysisExecutor.execute(&top_ctx).await.unwrap();
    let rows = output["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["region"], "NA");
    assert_eq!(rows[1]["region"], "EU");
  }

  #[tokio::test]
  async fn test_malformed_input_is_rejected() {
    let ctx = ctx(
      DerivedOperation::Share {
        source: "q".to_string(),
        measure: "revenue".to_string(),
      },
      vec![("q", json!({ "rows": [ { "region": "EU" } ] }))],
    );
    let err = DerivedAnalysisExecutor.execute(&ctx).await.unwrap_err();
    assert!(matches!(err, StepError::InvalidInput { ref step_id, .. } if step_id == "q"));
  }
}
