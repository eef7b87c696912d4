use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use prism_config::{ConfigError, Settings};
use prism_engine::{EngineError, ExecutionStatus, ExecutorRegistry, StartParams, WorkflowEngine};
use prism_query::{QueryError, QueryOptimizer, QueryRequest, UsageContext};
use prism_workflow::TemplateError;

mod analysis;
mod exit_codes;
mod fixture;
mod session;

use analysis::{LocalTester, RuleSynthesizer};
use fixture::{Dataset, DatasetError};
use session::Session;

/// Malformed command-line input.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

/// Prism - query optimization and analysis workflows over a semantic layer
#[derive(Parser)]
#[command(name = "prism")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Settings file (TOML or JSON). `PRISM__*` variables override it.
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Dataset with models and rows (default: the bundled retail demo)
  #[arg(long, global = true)]
  dataset: Option<PathBuf>,

  /// Extra templates to register (a JSON template or list)
  #[arg(long, global = true)]
  templates: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// List registered workflow templates
  Templates,

  /// Execute a query request (JSON argument, or stdin)
  Query { request: Option<String> },

  /// Score a query request without executing it
  Estimate { request: Option<String> },

  /// Run a workflow template to completion
  Run {
    template_id: String,

    /// Start parameters as JSON: args, filters, failure_policy, timeout_ms
    #[arg(long)]
    params: Option<String>,
  },

  /// Serve JSON-lines commands on stdin/stdout
  Session,
}

struct App {
  engine: WorkflowEngine,
  optimizer: Arc<QueryOptimizer>,
  usage: Arc<dyn UsageContext>,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
    .init();

  let cli = Cli::parse();
  let code = match run_cli(cli).await {
    Ok(code) => code,
    Err(e) => {
      eprintln!("Error: {:#}", e);
      map_error_to_exit_code(&e)
    }
  };
  std::process::exit(code);
}

fn map_error_to_exit_code(e: &anyhow::Error) -> i32 {
  if e.downcast_ref::<ConfigError>().is_some() || e.downcast_ref::<DatasetError>().is_some() {
    return exit_codes::CONFIG_ERROR;
  }
  if e.downcast_ref::<UsageError>().is_some() {
    return exit_codes::USAGE_ERROR;
  }
  if let Some(err) = e.downcast_ref::<QueryError>() {
    return exit_codes::for_kind(err.kind());
  }
  if let Some(err) = e.downcast_ref::<EngineError>() {
    return exit_codes::for_kind(err.kind());
  }
  if let Some(err) = e.downcast_ref::<TemplateError>() {
    return exit_codes::for_kind(err.kind());
  }
  exit_codes::GENERAL_ERROR
}

async fn run_cli(cli: Cli) -> Result<i32> {
  let app = build(&cli)?;

  match cli.command {
    Commands::Templates => {
      println!("{}", serde_json::to_string_pretty(&app.engine.templates())?);
    }
    Commands::Query { request } => {
      let request = parse_request(request)?;
      let outcome = app
        .optimizer
        .execute(&request, Some(app.usage.as_ref()))
        .await?;
      println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    Commands::Estimate { request } => {
      let request = parse_request(request)?;
      let score = app.optimizer.estimate(&request)?;
      println!("{}", serde_json::to_string_pretty(&score)?);
    }
    Commands::Run {
      template_id,
      params,
    } => return run_workflow(&app, &template_id, params).await,
    Commands::Session => {
      let session = Session::new(app.engine, app.optimizer, app.usage);
      let stdin = tokio::io::BufReader::new(tokio::io::stdin());
      session.run(stdin, tokio::io::stdout()).await?;
    }
  }

  Ok(exit_codes::SUCCESS)
}

fn build(cli: &Cli) -> Result<App> {
  let settings = Settings::load(cli.config.as_deref())?;
  let dataset = Dataset::load(cli.dataset.as_deref())?;

  let catalog = Arc::new(dataset.catalog());
  let (backend, usage) = dataset.into_parts();
  let usage: Arc<dyn UsageContext> = Arc::new(usage);
  let optimizer = Arc::new(QueryOptimizer::new(catalog, Arc::new(backend), &settings));

  let executors = ExecutorRegistry::standard(
    optimizer.clone(),
    Some(usage.clone()),
    Arc::new(LocalTester),
    Arc::new(RuleSynthesizer),
  );
  let engine = WorkflowEngine::new(settings.engine.clone(), executors);

  let mut templates = prism_workflow::builtin_templates();
  if let Some(path) = &cli.templates {
    templates.extend(prism_workflow::load_templates(path)?);
  }
  for template in templates {
    let summary = engine.register_template(template)?;
    info!(template_id = %summary.id, steps = summary.steps.len(), "template_registered");
  }

  Ok(App {
    engine,
    optimizer,
    usage,
  })
}

async fn run_workflow(app: &App, template_id: &str, params: Option<String>) -> Result<i32> {
  let params: StartParams = match params {
    Some(raw) => serde_json::from_str(&raw)
      .map_err(|e| UsageError(format!("invalid --params: {}", e)))?,
    None => StartParams::default(),
  };

  let execution_id = app.engine.start(template_id, params)?;
  let execution = tokio::select! {
    execution = app.engine.wait(&execution_id) => execution?,
    _ = tokio::signal::ctrl_c() => {
      warn!(execution_id = %execution_id, "interrupted");
      app.engine.cancel(&execution_id)?;
      app.engine.wait(&execution_id).await?
    }
  };

  println!("{}", serde_json::to_string_pretty(&execution)?);
  Ok(match execution.status {
    ExecutionStatus::Completed => exit_codes::SUCCESS,
    _ => exit_codes::STEP_FAILURE,
  })
}

/// Request JSON from the argument, or from stdin when piped.
fn parse_request(arg: Option<String>) -> Result<QueryRequest> {
  use std::io::IsTerminal;

  let raw = match arg {
    Some(raw) => raw,
    None if io::stdin().is_terminal() => {
      return Err(UsageError("pass a request as an argument or on stdin".to_string()).into());
    }
    None => {
      let mut input = String::new();
      io::stdin()
        .read_to_string(&mut input)
        .context("failed to read request from stdin")?;
      input
    }
  };
  let request = serde_json::from_str(&raw)
    .map_err(|e| UsageError(format!("invalid query request: {}", e)))?;
  Ok(request)
}
