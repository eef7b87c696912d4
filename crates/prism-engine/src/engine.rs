//! Workflow engine.
//!
//! The `WorkflowEngine` owns registered templates and live executions. `start`
//! hands each execution to its own scheduler task; callers observe progress
//! through `status` snapshots, `wait`, or an `ExecutionNotifier`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use prism_config::EngineSettings;
use prism_workflow::{TemplateError, TemplateSummary, WorkflowTemplate, WorkflowTemplateCatalog};
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::EngineError;
use crate::events::{ExecutionNotifier, NoopNotifier};
use crate::execution::{ExecutionStatus, StartParams, StepResult, WorkflowExecution};
use crate::executor::ExecutorRegistry;
use crate::scheduler::Scheduler;

pub(crate) struct EngineInner<N: ExecutionNotifier> {
  pub(crate) settings: EngineSettings,
  pub(crate) executors: ExecutorRegistry,
  /// Shared by every execution.
  pub(crate) worker_pool: Arc<Semaphore>,
  pub(crate) notifier: N,
  catalog: RwLock<WorkflowTemplateCatalog>,
  executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
}

/// Live state of one execution, shared between the engine and its scheduler.
pub(crate) struct ExecutionHandle {
  state: Mutex<WorkflowExecution>,
  pub(crate) cancel: CancellationToken,
  pub(crate) status_tx: watch::Sender<ExecutionStatus>,
  finished: Mutex<Option<Instant>>,
}

impl ExecutionHandle {
  pub(crate) fn lock(&self) -> MutexGuard<'_, WorkflowExecution> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn mark_finished(&self) {
    *self.finished.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
  }

  fn finished_at(&self) -> Option<Instant> {
    *self.finished.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn status(&self) -> ExecutionStatus {
    *self.status_tx.borrow()
  }

  fn snapshot(&self) -> WorkflowExecution {
    self.lock().clone()
  }
}

/// The workflow execution engine.
///
/// Generic over `N: ExecutionNotifier` to allow different notification strategies.
/// Use `WorkflowEngine::new()` for an engine with no-op notifications,
/// or `WorkflowEngine::with_notifier()` to provide a custom notifier.
///
/// Cheap to clone; clones share templates and executions.
pub struct WorkflowEngine<N: ExecutionNotifier = NoopNotifier> {
  inner: Arc<EngineInner<N>>,
}

impl<N: ExecutionNotifier> Clone for WorkflowEngine<N> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl WorkflowEngine<NoopNotifier> {
  pub fn new(settings: EngineSettings, executors: ExecutorRegistry) -> Self {
    Self::with_notifier(settings, executors, NoopNotifier)
  }
}

impl<N: ExecutionNotifier> WorkflowEngine<N> {
  pub fn with_notifier(settings: EngineSettings, executors: ExecutorRegistry, notifier: N) -> Self {
    let worker_pool = Arc::new(Semaphore::new(settings.worker_pool_size.max(1)));
    Self {
      inner: Arc::new(EngineInner {
        settings,
        executors,
        worker_pool,
        notifier,
        catalog: RwLock::new(WorkflowTemplateCatalog::new()),
        executions: RwLock::new(HashMap::new()),
      }),
    }
  }

  pub fn settings(&self) -> &EngineSettings {
    &self.inner.settings
  }

  /// Validate a template's graph and every step's parameters, then add it.
  pub fn register_template(&self, template: WorkflowTemplate) -> Result<TemplateSummary, EngineError> {
    template.validate()?;

    for step in &template.steps {
      let kind = step.kind.tag();
      let executor = self
        .inner
        .executors
        .get(kind)
        .ok_or_else(|| EngineError::MissingExecutor {
          template_id: template.id.clone(),
          step_id: step.id.clone(),
          kind,
        })?;
      executor
        .validate(step)
        .map_err(|message| TemplateError::InvalidStep {
          template_id: template.id.clone(),
          step_id: step.id.clone(),
          message,
        })?;
    }

    let registered = self
      .inner
      .catalog
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .register(template)?;
    Ok(registered.summary())
  }

  pub fn templates(&self) -> Vec<TemplateSummary> {
    self.catalog().list()
  }

  pub fn template(&self, template_id: &str) -> Result<Arc<WorkflowTemplate>, EngineError> {
    Ok(self.catalog().get(template_id)?)
  }

  /// Create an execution and hand it to a scheduler task.
  ///
  /// Must be called from within a Tokio runtime.
  #[instrument(name = "workflow_start", skip_all, fields(template_id = %template_id))]
  pub fn start(&self, template_id: &str, params: StartParams) -> Result<String, EngineError> {
    self.purge_expired();

    let template = self.template(template_id)?;
    let graph = template.graph();
    let order = graph
      .topological_order()
      .map_err(|steps| TemplateError::Cycle {
        template_id: template.id.clone(),
        steps,
      })?;
    let policy = params.failure_policy.unwrap_or(template.failure_policy);
    let execution_id = uuid::Uuid::new_v4().to_string();

    let steps: BTreeMap<String, StepResult> = template
      .steps
      .iter()
      .map(|s| (s.id.clone(), StepResult::pending(&s.id, s.kind.tag())))
      .collect();
    let execution = WorkflowExecution {
      execution_id: execution_id.clone(),
      template_id: template.id.clone(),
      status: ExecutionStatus::Pending,
      failure_policy: policy,
      steps,
      started_at: Utc::now(),
      finished_at: None,
      result: None,
    };
    let (status_tx, _) = watch::channel(ExecutionStatus::Pending);
    let handle = Arc::new(ExecutionHandle {
      state: Mutex::new(execution),
      cancel: CancellationToken::new(),
      status_tx,
      finished: Mutex::new(None),
    });

    {
      let mut executions = self.executions_mut();
      let max = self.inner.settings.max_active_executions;
      let active = executions
        .values()
        .filter(|h| !h.status().is_terminal())
        .count();
      if active >= max {
        return Err(EngineError::Capacity { active, max });
      }
      executions.insert(execution_id.clone(), handle.clone());
    }

    info!(execution_id = %execution_id, "workflow_submitted");
    let scheduler = Scheduler::new(
      self.inner.clone(),
      handle,
      template,
      graph,
      order,
      params,
      policy,
      execution_id.clone(),
    );
    tokio::spawn(scheduler.run());

    Ok(execution_id)
  }

  /// Snapshot of an execution.
  pub fn status(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
    self.purge_expired();
    Ok(self.handle(execution_id)?.snapshot())
  }

  /// Request cancellation. Steps not yet started are skipped; running steps are
  /// signalled through their token. Returns the status at the time of the call.
  pub fn cancel(&self, execution_id: &str) -> Result<ExecutionStatus, EngineError> {
    let handle = self.handle(execution_id)?;
    let status = handle.status();
    if !status.is_terminal() {
      info!(execution_id = %execution_id, "workflow_cancel_requested");
      handle.cancel.cancel();
    }
    Ok(status)
  }

  /// Wait for an execution to reach a terminal status and return its snapshot.
  pub async fn wait(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
    let handle = self.handle(execution_id)?;
    let mut status_rx = handle.status_tx.subscribe();
    // The handle owns the sender, so this only returns once terminal.
    let _ = status_rx.wait_for(|status| status.is_terminal()).await;
    Ok(handle.snapshot())
  }

  /// Drop finished executions older than the retention period.
  pub fn purge_expired(&self) -> usize {
    let retention = self.inner.settings.execution_retention();
    let now = Instant::now();
    let mut executions = self.executions_mut();
    let before = executions.len();
    executions.retain(|_, handle| {
      handle
        .finished_at()
        .is_none_or(|finished| now.duration_since(finished) < retention)
    });

    let purged = before - executions.len();
    if purged > 0 {
      debug!(purged, "executions_purged");
    }
    purged
  }

  /// Number of executions pending or running.
  pub fn active_executions(&self) -> usize {
    self
      .inner
      .executions
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .values()
      .filter(|h| !h.status().is_terminal())
      .count()
  }

  fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>, EngineError> {
    self
      .inner
      .executions
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(execution_id)
      .cloned()
      .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
  }

  fn catalog(&self) -> std::sync::RwLockReadGuard<'_, WorkflowTemplateCatalog> {
    self.inner.catalog.read().unwrap_or_else(|e| e.into_inner())
  }

  fn executions_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ExecutionHandle>>> {
    self.inner.executions.write().unwrap_or_else(|e| e.into_inner())
  }
}
