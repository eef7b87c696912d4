//! Built-in analysis templates over the retail models (`orders`, `customers`,
//! `sessions`).

use std::collections::BTreeMap;

use serde_json::json;

use crate::step::{
  DerivedOperation, InsightSynthesisStep, QueryStep, StatisticalTestStep, StepDefinition, StepKind,
  TestMethod,
};
use crate::template::{FailurePolicy, WorkflowTemplate};

pub fn templates() -> Vec<WorkflowTemplate> {
  vec![
    regional_revenue_overview(),
    channel_comparison(),
    period_over_period(),
    conversion_test(),
  ]
}

fn query(
  id: &str,
  model: &str,
  dimensions: &[&str],
  measures: &[&str],
  filters: BTreeMap<String, serde_json::Value>,
) -> StepDefinition {
  StepDefinition::new(
    id,
    StepKind::Query(QueryStep {
      model: model.to_string(),
      dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
      measures: measures.iter().map(|m| m.to_string()).collect(),
      filters,
      limit: None,
    }),
  )
}

fn synthesis(id: &str, focus: &str) -> StepDefinition {
  StepDefinition::new(
    id,
    StepKind::InsightSynthesis(InsightSynthesisStep {
      focus: Some(focus.to_string()),
      ..Default::default()
    }),
  )
}

fn filter(key: &str, predicate: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
  BTreeMap::from([(key.to_string(), predicate)])
}

/// Three independent slices of the business, summarized together.
fn regional_revenue_overview() -> WorkflowTemplate {
  WorkflowTemplate::new("regional_revenue_overview", "Regional revenue overview")
    .description("Revenue by region, customer segments and channel traffic, summarized")
    .step(query(
      "revenue_by_region",
      "orders",
      &["region"],
      &["revenue", "order_count"],
      BTreeMap::new(),
    ))
    .step(query(
      "customers_by_segment",
      "customers",
      &["segment"],
      &["customer_count", "lifetime_value"],
      BTreeMap::new(),
    ))
    .step(query(
      "sessions_by_channel",
      "sessions",
      &["channel"],
      &["sessions", "conversions"],
      BTreeMap::new(),
    ))
    .step(synthesis("summary", "revenue").depends_on([
      "revenue_by_region",
      "customers_by_segment",
      "sessions_by_channel",
    ]))
}

/// Rank channels, then break the leading channel down by region.
fn channel_comparison() -> WorkflowTemplate {
  WorkflowTemplate::new("channel_comparison", "Channel comparison")
    .description("Channel revenue shares and a regional breakdown of the top channel")
    .step(query(
      "revenue_by_channel",
      "orders",
      &["channel"],
      &["revenue", "order_count"],
      BTreeMap::new(),
    ))
    .step(
      StepDefinition::new(
        "top_channel",
        StepKind::DerivedAnalysis(DerivedOperation::TopN {
          source: "revenue_by_channel".to_string(),
          measure: "revenue".to_string(),
          n: 1,
        }),
      )
      .depends_on(["revenue_by_channel"]),
    )
    .step(
      StepDefinition::new(
        "channel_share",
        StepKind::DerivedAnalysis(DerivedOperation::Share {
          source: "revenue_by_channel".to_string(),
          measure: "revenue".to_string(),
        }),
      )
      .depends_on(["revenue_by_channel"]),
    )
    .step(
      query(
        "top_channel_regions",
        "orders",
        &["region"],
        &["revenue"],
        filter("channel", json!({ "eq": "{{ top_channel.rows[0].channel }}" })),
      )
      .depends_on(["top_channel"]),
    )
    .step(synthesis("summary", "channel").depends_on(["channel_share", "top_channel_regions"]))
}

/// Compare two months region by region.
fn period_over_period() -> WorkflowTemplate {
  WorkflowTemplate::new("period_over_period", "Period over period")
    .description("Regional revenue change between two months, with a significance test")
    .step(query(
      "current_period",
      "orders",
      &["region"],
      &["revenue"],
      filter("month", json!({ "eq": "{{ params.current_month | default(12) }}" })),
    ))
    .step(query(
      "previous_period",
      "orders",
      &["region"],
      &["revenue"],
      filter("month", json!({ "eq": "{{ params.previous_month | default(11) }}" })),
    ))
    .step(
      StepDefinition::new(
        "revenue_change",
        StepKind::DerivedAnalysis(DerivedOperation::PercentChange {
          baseline: "previous_period".to_string(),
          current: "current_period".to_string(),
          measure: "revenue".to_string(),
          key: "region".to_string(),
        }),
      )
      .depends_on(["previous_period", "current_period"]),
    )
    .step(
      StepDefinition::new(
        "revenue_shift",
        StepKind::StatisticalTest(StatisticalTestStep {
          method: TestMethod::WelchT,
          measure: "revenue".to_string(),
          baseline: "previous_period".to_string(),
          comparison: "current_period".to_string(),
          trials_measure: None,
          alpha: 0.05,
        }),
      )
      .depends_on(["previous_period", "current_period"]),
    )
    .step(synthesis("summary", "revenue").depends_on(["revenue_change", "revenue_shift"]))
}

/// Two-proportion test of conversion rates between two channels. All steps are
/// required, so the template fails fast.
fn conversion_test() -> WorkflowTemplate {
  WorkflowTemplate::new("conversion_test", "Conversion rate test")
    .description("Compare conversion rates of two channels across regions")
    .failure_policy(FailurePolicy::FailFast)
    .step(query(
      "baseline_channel",
      "sessions",
      &["region"],
      &["conversions", "sessions"],
      filter("channel", json!({ "eq": "{{ params.baseline | default('store') }}" })),
    ))
    .step(query(
      "comparison_channel",
      "sessions",
      &["region"],
      &["conversions", "sessions"],
      filter("channel", json!({ "eq": "{{ params.comparison | default('web') }}" })),
    ))
    .step(
      StepDefinition::new(
        "conversion_lift",
        StepKind::StatisticalTest(StatisticalTestStep {
          method: TestMethod::TwoProportionZ,
          measure: "conversions".to_string(),
          baseline: "baseline_channel".to_string(),
          comparison: "comparison_channel".to_string(),
          trials_measure: Some("sessions".to_string()),
          alpha: 0.05,
        }),
      )
      .depends_on(["baseline_channel", "comparison_channel"]),
    )
}
