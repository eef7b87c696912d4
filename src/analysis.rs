//! Local stand-ins for the statistics and insight services.

use async_trait::async_trait;
use prism_engine::{InsightSynthesizer, StatisticalTester, StepInput};
use prism_query::BackendError;
use prism_workflow::{InsightSynthesisStep, StatisticalTestStep, TestMethod};
use serde_json::{Value, json};

/// Welch's t-test and the two-proportion z-test over query-step rows.
pub struct LocalTester;

#[async_trait]
impl StatisticalTester for LocalTester {
  async fn test(
    &self,
    params: &StatisticalTestStep,
    baseline: &Value,
    comparison: &Value,
  ) -> Result<Value, BackendError> {
    match params.method {
      TestMethod::WelchT => welch_t(params, baseline, comparison),
      TestMethod::TwoProportionZ => two_proportion_z(params, baseline, comparison),
    }
  }
}

fn column(output: &Value, measure: &str) -> Result<Vec<f64>, BackendError> {
  let rows = output
    .get("rows")
    .and_then(Value::as_array)
    .ok_or_else(|| BackendError::new("input has no rows"))?;
  rows
    .iter()
    .map(|row| {
      row
        .get(measure)
        .and_then(Value::as_f64)
        .ok_or_else(|| BackendError::new(format!("row has no numeric '{}'", measure)))
    })
    .collect()
}

fn mean_and_variance(sample: &[f64]) -> (f64, f64) {
  let n = sample.len() as f64;
  let mean = sample.iter().sum::<f64>() / n;
  let variance = sample.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
  (mean, variance)
}

fn welch_t(
  params: &StatisticalTestStep,
  baseline: &Value,
  comparison: &Value,
) -> Result<Value, BackendError> {
  let a = column(baseline, &params.measure)?;
  let b = column(comparison, &params.measure)?;
  if a.len() < 2 || b.len() < 2 {
    return Err(BackendError::new(
      "welch_t needs at least two rows in each sample",
    ));
  }

  let (mean_a, var_a) = mean_and_variance(&a);
  let (mean_b, var_b) = mean_and_variance(&b);
  let (na, nb) = (a.len() as f64, b.len() as f64);
  let (sa, sb) = (var_a / na, var_b / nb);
  let se = (sa + sb).sqrt();
  if se == 0.0 {
    return Err(BackendError::new("both samples have zero variance"));
  }

  let statistic = (mean_b - mean_a) / se;
  let df = (sa + sb).powi(2) / (sa.powi(2) / (na - 1.0) + sb.powi(2) / (nb - 1.0));
  let p_value = student_t_two_sided(statistic, df);

  Ok(json!({
    "method": "welch_t",
    "measure": params.measure,
    "baseline": { "step": params.baseline, "n": a.len(), "mean": mean_a },
    "comparison": { "step": params.comparison, "n": b.len(), "mean": mean_b },
    "effect": mean_b - mean_a,
    "statistic": statistic,
    "degrees_of_freedom": df,
    "p_value": p_value,
    "alpha": params.alpha,
    "significant": p_value < params.alpha,
  }))
}

fn two_proportion_z(
  params: &StatisticalTestStep,
  baseline: &Value,
  comparison: &Value,
) -> Result<Value, BackendError> {
  let trials_measure = params
    .trials_measure
    .as_deref()
    .ok_or_else(|| BackendError::new("two_proportion_z needs trials_measure"))?;

  let totals = |output: &Value| -> Result<(f64, f64), BackendError> {
    let successes: f64 = column(output, &params.measure)?.iter().sum();
    let trials: f64 = column(output, trials_measure)?.iter().sum();
    if trials <= 0.0 || successes > trials {
      return Err(BackendError::new(format!(
        "invalid proportion {}/{}",
        successes, trials
      )));
    }
    Ok((successes, trials))
  };
  let (x1, n1) = totals(baseline)?;
  let (x2, n2) = totals(comparison)?;

  let (p1, p2) = (x1 / n1, x2 / n2);
  let pooled = (x1 + x2) / (n1 + n2);
  let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
  if se == 0.0 {
    return Err(BackendError::new("pooled proportion is 0 or 1"));
  }
  let statistic = (p2 - p1) / se;
  let p_value = normal_two_sided(statistic);

  Ok(json!({
    "method": "two_proportion_z",
    "measure": params.measure,
    "baseline": { "step": params.baseline, "trials": n1, "rate": p1 },
    "comparison": { "step": params.comparison, "trials": n2, "rate": p2 },
    "effect": p2 - p1,
    "statistic": statistic,
    "p_value": p_value,
    "alpha": params.alpha,
    "significant": p_value < params.alpha,
  }))
}

/// Two-sided tail probability of a standard normal.
fn normal_two_sided(z: f64) -> f64 {
  (1.0 - erf(z.abs() / std::f64::consts::SQRT_2)).clamp(0.0, 1.0)
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
  let t = 1.0 / (1.0 + 0.327_591_1 * x);
  let poly = t
    * (0.254_829_592
      + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
  1.0 - poly * (-x * x).exp()
}

/// Two-sided tail probability of Student's t with `df` degrees of freedom.
fn student_t_two_sided(t: f64, df: f64) -> f64 {
  incomplete_beta(df / 2.0, 0.5, df / (df + t * t)).clamp(0.0, 1.0)
}

/// Regularized incomplete beta I_x(a, b).
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
  if x <= 0.0 {
    return 0.0;
  }
  if x >= 1.0 {
    return 1.0;
  }
  let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();
  if x < (a + 1.0) / (a + b + 2.0) {
    front * beta_fraction(a, b, x) / a
  } else {
    1.0 - front * beta_fraction(b, a, 1.0 - x) / b
  }
}

/// Continued fraction for the incomplete beta (modified Lentz).
fn beta_fraction(a: f64, b: f64, x: f64) -> f64 {
  const TINY: f64 = 1e-30;
  let mut c = 1.0;
  let mut d = 1.0 - (a + b) * x / (a + 1.0);
  if d.abs() < TINY {
    d = TINY;
  }
  d = 1.0 / d;
  let mut h = d;

  for m in 1..200 {
    let m = m as f64;
    let m2 = 2.0 * m;

    let even = m * (b - m) * x / ((a + m2 - 1.0) * (a + m2));
    d = 1.0 + even * d;
    d = if d.abs() < TINY { TINY } else { d };
    c = 1.0 + even / c;
    c = if c.abs() < TINY { TINY } else { c };
    d = 1.0 / d;
    h *= d * c;

    let odd = -(a + m) * (a + b + m) * x / ((a + m2) * (a + m2 + 1.0));
    d = 1.0 + odd * d;
    d = if d.abs() < TINY { TINY } else { d };
    c = 1.0 + odd / c;
    c = if c.abs() < TINY { TINY } else { c };
    d = 1.0 / d;
    let delta = d * c;
    h *= delta;
    if (delta - 1.0).abs() < 1e-12 {
      break;
    }
  }
  h
}

/// Lanczos approximation (g = 7, n = 9).
fn ln_gamma(x: f64) -> f64 {
  const COEFFICIENTS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
  ];
  if x < 0.5 {
    let pi = std::f64::consts::PI;
    return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
  }
  let x = x - 1.0;
  let mut sum = COEFFICIENTS[0];
  for (i, c) in COEFFICIENTS.iter().enumerate().skip(1) {
    sum += c / (x + i as f64);
  }
  let t = x + 7.5;
  0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

/// Rule-based findings over dependency outputs.
pub struct RuleSynthesizer;

#[derive(Debug)]
struct Insight {
  source: String,
  kind: &'static str,
  text: String,
  score: f64,
}

#[async_trait]
impl InsightSynthesizer for RuleSynthesizer {
  async fn synthesize(
    &self,
    params: &InsightSynthesisStep,
    inputs: &[StepInput],
  ) -> Result<Value, BackendError> {
    if inputs.is_empty() {
      return Err(BackendError::new("nothing to synthesize"));
    }

    let mut insights: Vec<Insight> = inputs.iter().filter_map(insight_for).collect();
    if let Some(focus) = &params.focus {
      for insight in &mut insights {
        if insight.text.contains(focus.as_str()) {
          insight.score += 0.2;
        }
      }
    }
    insights.sort_by(|a, b| b.score.total_cmp(&a.score));
    insights.truncate(params.max_insights);

    let insights: Vec<Value> = insights
      .into_iter()
      .map(|i| {
        json!({
          "source": i.source,
          "kind": i.kind,
          "text": i.text,
          "score": (i.score * 100.0).round() / 100.0,
        })
      })
      .collect();
    Ok(json!({
      "focus": params.focus,
      "sources": inputs.len(),
      "insights": insights,
    }))
  }
}

fn insight_for(input: &StepInput) -> Option<Insight> {
  let output = &input.output;
  let insight = |kind, text: String, score: f64| Insight {
    source: input.step_id.clone(),
    kind,
    text,
    score: score.min(1.0),
  };

  if let Some(p_value) = output.get("p_value").and_then(Value::as_f64) {
    let measure = output["measure"].as_str().unwrap_or("measure");
    let significant = output["significant"].as_bool().unwrap_or(false);
    let text = if significant {
      format!("{} differs significantly between samples (p = {:.3})", measure, p_value)
    } else {
      format!("no significant difference in {} (p = {:.3})", measure, p_value)
    };
    return Some(insight("significance", text, if significant { 0.9 } else { 0.4 }));
  }

  let rows = output.get("rows")?.as_array()?;
  let measure = output
    .get("measure")
    .and_then(Value::as_str)
    .map(str::to_string)
    .or_else(|| first_measure(output, rows))?;

  match output.get("operation").and_then(Value::as_str) {
    Some("percent_change") => {
      let (row, change) = rows
        .iter()
        .filter_map(|r| Some((r, r.get("percent_change")?.as_f64()?)))
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))?;
      let text = format!("{} moved {:+.1}% in {}", label(row, &measure), change, measure);
      Some(insight("change", text, 0.5 + change.abs() / 100.0))
    }
    Some("share") => {
      let (row, share) = rows
        .iter()
        .filter_map(|r| Some((r, r.get("share")?.as_f64()?)))
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
      let text = format!(
        "{} holds {:.1}% of {}",
        label(row, &measure),
        share * 100.0,
        measure
      );
      Some(insight("share", text, share))
    }
    _ => {
      let (row, value) = rows
        .iter()
        .filter_map(|r| Some((r, r.get(&measure)?.as_f64()?)))
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
      let text = format!("{} leads {} with {}", label(row, &measure), measure, value);
      Some(insight("leader", text, 0.5))
    }
  }
}

/// First column whose values are all numeric.
fn first_measure(output: &Value, rows: &[Value]) -> Option<String> {
  output
    .get("columns")?
    .as_array()?
    .iter()
    .filter_map(Value::as_str)
    .find(|column| {
      !rows.is_empty() && rows.iter().all(|r| r.get(*column).is_some_and(Value::is_number))
    })
    .map(str::to_string)
}

/// Non-numeric fields of a row, joined.
fn label(row: &Value, measure: &str) -> String {
  let parts: Vec<String> = row
    .as_object()
    .map(|map| {
      map
        .iter()
        .filter(|(k, v)| k.as_str() != measure && !v.is_number() && !v.is_null())
        .map(|(_, v)| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        .collect()
    })
    .unwrap_or_default();
  if parts.is_empty() {
    "total".to_string()
  } else {
    parts.join("/")
  }
}
