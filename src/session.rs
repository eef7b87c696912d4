//! JSON-lines control session.
//!
//! Each input line is one command, each output line one reply:
//! ```text
//! > {"command":"start","template_id":"channel_performance","params":{}}
//! < {"ok":true,"result":{"execution_id":"..."}}
//! > {"command":"wait","execution_id":"..."}
//! < {"ok":true,"result":{"status":"completed",...}}
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use prism_engine::{EngineError, StartParams, WorkflowEngine};
use prism_query::{QueryError, QueryOptimizer, QueryRequest, UsageContext};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
  ListTemplates,
  Start {
    template_id: String,
    #[serde(default)]
    params: StartParams,
  },
  Status {
    execution_id: String,
  },
  Wait {
    execution_id: String,
  },
  Cancel {
    execution_id: String,
  },
  Query {
    request: QueryRequest,
  },
  Estimate {
    request: QueryRequest,
  },
  Insights {
    model: String,
  },
  CacheStats,
}

#[derive(Debug, Serialize)]
struct Failure {
  kind: String,
  message: String,
}

impl From<EngineError> for Failure {
  fn from(e: EngineError) -> Self {
    Self {
      kind: e.kind().to_string(),
      message: e.to_string(),
    }
  }
}

impl From<QueryError> for Failure {
  fn from(e: QueryError) -> Self {
    Self {
      kind: e.kind().to_string(),
      message: e.to_string(),
    }
  }
}

impl From<serde_json::Error> for Failure {
  fn from(e: serde_json::Error) -> Self {
    Self {
      kind: "usage_error".to_string(),
      message: e.to_string(),
    }
  }
}

pub struct Session {
  engine: WorkflowEngine,
  optimizer: Arc<QueryOptimizer>,
  usage: Arc<dyn UsageContext>,
}

impl Session {
  pub fn new(
    engine: WorkflowEngine,
    optimizer: Arc<QueryOptimizer>,
    usage: Arc<dyn UsageContext>,
  ) -> Self {
    Self {
      engine,
      optimizer,
      usage,
    }
  }

  /// Serve commands until the reader hits end of input.
  pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    info!("session_started");
    let mut lines = reader.lines();
    let mut handled = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read command")? {
      if line.trim().is_empty() {
        continue;
      }
      let reply = match serde_json::from_str::<Command>(&line) {
        Ok(command) => self.handle(command).await,
        Err(e) => Err(Failure::from(e)),
      };
      let reply = match reply {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(failure) => {
          debug!(kind = %failure.kind, message = %failure.message, "session_command_failed");
          json!({ "ok": false, "error": failure })
        }
      };

      let mut out = serde_json::to_vec(&reply)?;
      out.push(b'\n');
      writer.write_all(&out).await.context("failed to write reply")?;
      writer.flush().await?;
      handled += 1;
    }

    info!(handled, "session_finished");
    Ok(())
  }

  async fn handle(&self, command: Command) -> Result<Value, Failure> {
    let result = match command {
      Command::ListTemplates => serde_json::to_value(self.engine.templates())?,
      Command::Start {
        template_id,
        params,
      } => {
        let execution_id = self.engine.start(&template_id, params)?;
        json!({ "execution_id": execution_id })
      }
      Command::Status { execution_id } => serde_json::to_value(self.engine.status(&execution_id)?)?,
      Command::Wait { execution_id } => {
        serde_json::to_value(self.engine.wait(&execution_id).await?)?
      }
      Command::Cancel { execution_id } => {
        let status = self.engine.cancel(&execution_id)?;
        json!({ "execution_id": execution_id, "status": status })
      }
      Command::Query { request } => {
        let outcome = self
          .optimizer
          .execute(&request, Some(self.usage.as_ref()))
          .await?;
        serde_json::to_value(outcome)?
      }
      Command::Estimate { request } => serde_json::to_value(self.optimizer.estimate(&request)?)?,
      Command::Insights { model } => {
        serde_json::to_value(self.optimizer.performance_insights(&model))?
      }
      Command::CacheStats => serde_json::to_value(self.optimizer.cache_stats())?,
    };
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::analysis::{LocalTester, RuleSynthesizer};
  use crate::fixture::Dataset;
  use prism_config::Settings;
  use prism_engine::ExecutorRegistry;

  fn session() -> Session {
    let settings = Settings::default();
    let dataset = Dataset::load(None).unwrap();
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
    for template in prism_workflow::builtin_templates() {
      engine.register_template(template).unwrap();
    }
    Session::new(engine, optimizer, usage)
  }

  async fn replies(input: &str) -> Vec<Value> {
    let mut out = Vec::new();
    session().run(input.as_bytes(), &mut out).await.unwrap();
    String::from_utf8(out)
      .unwrap()
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect()
  }

  #[tokio::test]
  async fn test_commands_and_errors() {
    let input = concat!(
      "{\"command\":\"list_templates\"}\n",
      "\n",
      "{\"command\":\"query\",\"request\":{\"model\":\"orders\",\"dimensions\":[\"region\"],\"measures\":[\"revenue\"]}}\n",
      "{\"command\":\"cache_stats\"}\n",
      "{\"command\":\"status\",\"execution_id\":\"missing\"}\n",
      "not json\n",
    );
    let replies = replies(input).await;
    assert_eq!(replies.len(), 5);

    assert_eq!(replies[0]["ok"], json!(true));
    assert!(!replies[0]["result"].as_array().unwrap().is_empty());
    assert_eq!(replies[1]["ok"], json!(true));
    assert_eq!(replies[2]["ok"], json!(true));

    assert_eq!(replies[3]["ok"], json!(false));
    assert_eq!(replies[3]["error"]["kind"], "validation_error");
    assert_eq!(replies[4]["error"]["kind"], "usage_error");
  }

  #[tokio::test]
  async fn test_unknown_model_is_a_validation_error() {
    let replies =
      replies("{\"command\":\"query\",\"request\":{\"model\":\"nope\",\"measures\":[\"x\"]}}\n").await;
    assert_eq!(replies[0]["error"]["kind"], "validation_error");
  }
}
