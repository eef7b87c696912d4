//! Query-step filter resolution using minijinja templates.
//!
//! Filter values are predicate objects whose string leaves may be templates. They
//! are rendered against a context holding the start parameters and every
//! dependency output:
//! ```json
//! { "params": { "month": 3 }, "top_channel": { "rows": [ { "channel": "web" } ] } }
//! ```
//! so `{"eq": "{{ top_channel.rows[0].channel }}"}` becomes `{"eq": "web"}`.
//!
//! # Coercion
//! A rendered template that reads as a boolean or a number becomes one, so
//! `{"eq": "{{ params.month }}"}` with `month = 3` yields the integer `3`.
//! Literal strings are left untouched.

use std::collections::BTreeMap;

use minijinja::{Environment, Value};
use prism_query::Predicate;

use crate::error::StepError;
use crate::execution::StartParams;
use crate::executor::StepInput;

const OPERATORS: [&str; 7] = ["eq", "ne", "in", "gt", "gte", "lt", "lte"];

/// Build the rendering context for a step.
pub fn template_context(params: &StartParams, inputs: &[StepInput]) -> serde_json::Value {
  let mut context = serde_json::Map::new();
  for input in inputs {
    context.insert(input.step_id.clone(), input.output.clone());
  }
  context.insert(
    "params".to_string(),
    serde_json::Value::Object(params.args.clone()),
  );
  serde_json::Value::Object(context)
}

/// Render every filter and parse the result into predicates.
pub fn resolve_filters(
  filters: &BTreeMap<String, serde_json::Value>,
  context: &serde_json::Value,
) -> Result<BTreeMap<String, Predicate>, StepError> {
  let env = Environment::new();
  let ctx_value = Value::from_serialize(context);

  let mut resolved = BTreeMap::new();
  for (key, raw) in filters {
    let rendered = render_value(&env, key, raw, &ctx_value)?;
    let predicate: Predicate = serde_json::from_value(rendered.clone()).map_err(|e| {
      StepError::input(format!(
        "filter '{}' resolved to {} which is not a predicate: {}",
        key, rendered, e
      ))
    })?;
    resolved.insert(key.clone(), predicate);
  }

  Ok(resolved)
}

/// Render the string leaves of a JSON value.
fn render_value(
  env: &Environment,
  key: &str,
  value: &serde_json::Value,
  context: &Value,
) -> Result<serde_json::Value, StepError> {
  match value {
    serde_json::Value::String(template) if is_template(template) => {
      let rendered = env
        .render_str(template, context.clone())
        .map_err(|e| StepError::input(format!("failed to resolve filter '{}': {}", key, e)))?;
      if rendered.trim().is_empty() {
        return Err(StepError::input(format!(
          "filter '{}' rendered '{}' to an empty value",
          key, template
        )));
      }
      Ok(coerce_value(rendered.trim()))
    }
    serde_json::Value::Array(items) => items
      .iter()
      .map(|item| render_value(env, key, item, context))
      .collect::<Result<Vec<_>, _>>()
      .map(serde_json::Value::Array),
    serde_json::Value::Object(map) => {
      let mut out = serde_json::Map::new();
      for (k, v) in map {
        out.insert(k.clone(), render_value(env, key, v, context)?);
      }
      Ok(serde_json::Value::Object(out))
    }
    other => Ok(other.clone()),
  }
}

fn is_template(value: &str) -> bool {
  value.contains("{{") || value.contains("{%")
}

/// Coerce a rendered string to the narrowest JSON scalar it reads as.
fn coerce_value(value: &str) -> serde_json::Value {
  match value {
    "true" => return serde_json::Value::Bool(true),
    "false" => return serde_json::Value::Bool(false),
    _ => {}
  }
  if let Ok(n) = value.parse::<i64>() {
    return serde_json::Value::Number(n.into());
  }
  if let Some(n) = value
    .parse::<f64>()
    .ok()
    .filter(|n| n.is_finite())
    .and_then(serde_json::Number::from_f64)
  {
    return serde_json::Value::Number(n);
  }
  serde_json::Value::String(value.to_string())
}

/// Check that an unrendered filter has the shape of a predicate.
pub fn check_predicate_shape(key: &str, value: &serde_json::Value) -> Result<(), String> {
  let Some(map) = value.as_object() else {
    return Err(format!("filter '{}' must be an object like {{\"eq\": ...}}", key));
  };
  match map.keys().next() {
    Some(op) if map.len() == 1 && OPERATORS.contains(&op.as_str()) => Ok(()),
    _ => Err(format!(
      "filter '{}' must have exactly one operator of {}",
      key,
      OPERATORS.join(", ")
    )),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use prism_query::Scalar;
  use serde_json::json;

  fn inputs() -> Vec<StepInput> {
    vec![StepInput {
      step_id: "top_channel".to_string(),
      output: json!({ "rows": [ { "channel": "web", "revenue": 120.5 } ] }),
    }]
  }

  #[test]
  fn test_renders_dependency_outputs() {
    let context = template_context(&StartParams::default(), &inputs());
    let filters = BTreeMap::from([(
      "channel".to_string(),
      json!({ "eq": "{{ top_channel.rows[0].channel }}" }),
    )]);

    let resolved = resolve_filters(&filters, &context).unwrap();
    assert_eq!(resolved["channel"], Predicate::Eq(Scalar::Str("web".into())));
  }

  #[test]
  fn test_coerces_rendered_scalars() {
    let params = StartParams::default().arg("month", json!(3)).arg("strict", json!(true));
    let context = template_context(&params, &[]);
    let filters = BTreeMap::from([
      ("month".to_string(), json!({ "eq": "{{ params.month }}" })),
      ("previous".to_string(), json!({ "eq": "{{ params.prev | default(2) }}" })),
      ("flag".to_string(), json!({ "eq": "{{ params.strict }}" })),
      ("code".to_string(), json!({ "eq": "007" })),
      ("regions".to_string(), json!({ "in": ["EU", "{{ 'NA' }}"] })),
      ("revenue".to_string(), json!({ "gte": 100 })),
    ]);

    let resolved = resolve_filters(&filters, &context).unwrap();

    assert_eq!(resolved["month"], Predicate::Eq(Scalar::Int(3)));
    assert_eq!(resolved["previous"], Predicate::Eq(Scalar::Int(2)));
    assert_eq!(resolved["flag"], Predicate::Eq(Scalar::Bool(true)));
    assert_eq!(resolved["code"], Predicate::Eq(Scalar::Str("007".into())));
    assert_eq!(
      resolved["regions"],
      Predicate::In(vec![Scalar::Str("EU".into()), Scalar::Str("NA".into())])
    );
    assert_eq!(resolved["revenue"], Predicate::Gte(100.0));
  }

  #[test]
  fn test_missing_reference_is_an_error() {
    let context = template_context(&StartParams::default(), &[]);
    let filters = BTreeMap::from([(
      "channel".to_string(),
      json!({ "eq": "{{ top_channel.rows[0].channel }}" }),
    )]);

    let err = resolve_filters(&filters, &context).unwrap_err();
    assert!(matches!(err, StepError::Input { .. }));
  }

  #[test]
  fn test_predicate_shape() {
    assert!(check_predicate_shape("a", &json!({ "eq": "{{ x }}" })).is_ok());
    assert!(check_predicate_shape("a", &json!("EU")).is_err());
    assert!(check_predicate_shape("a", &json!({ "like": "E%" })).is_err());
    assert!(check_predicate_shape("a", &json!({ "gt": 1, "lt": 5 })).is_err());
  }
}
