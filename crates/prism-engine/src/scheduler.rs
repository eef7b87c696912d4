//! The per-execution scheduling loop.
//!
//! One scheduler task drives each execution. Step tasks report back over a
//! completion channel; the scheduler owns all state transitions, so the
//! execution snapshot is only ever written from here.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use prism_workflow::{FailurePolicy, Graph, WorkflowTemplate};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::engine::{EngineInner, ExecutionHandle};
use crate::error::StepError;
use crate::events::{ExecutionEvent, ExecutionNotifier};
use crate::execution::{
  AggregateResult, ErrorReport, ExecutionStatus, StartParams, StepStatus, WorkflowExecution,
};
use crate::executor::{StepContext, StepExecutor, StepInput};

/// Completion signal from a step task.
enum StepEvent {
  Started {
    step_id: String,
    at: DateTime<Utc>,
  },
  Finished {
    step_id: String,
    result: Result<serde_json::Value, StepError>,
    at: DateTime<Utc>,
  },
}

pub(crate) struct Scheduler<N: ExecutionNotifier> {
  inner: Arc<EngineInner<N>>,
  handle: Arc<ExecutionHandle>,
  template: Arc<WorkflowTemplate>,
  graph: Graph,
  order: Vec<String>,
  params: Arc<StartParams>,
  policy: FailurePolicy,
  execution_id: String,
  /// Child of the execution token; also cancelled when the deadline passes.
  steps_token: CancellationToken,
  /// Child of `steps_token`; also cancelled by a fail-fast failure. Steps
  /// still waiting for a worker never start once it fires.
  halt: CancellationToken,
  tx: mpsc::UnboundedSender<StepEvent>,
  rx: mpsc::UnboundedReceiver<StepEvent>,
  dispatched: HashSet<String>,
  in_flight: usize,
  failed: bool,
  cancelled: bool,
  deadline_passed: bool,
}

impl<N: ExecutionNotifier> Scheduler<N> {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    inner: Arc<EngineInner<N>>,
    handle: Arc<ExecutionHandle>,
    template: Arc<WorkflowTemplate>,
    graph: Graph,
    order: Vec<String>,
    params: StartParams,
    policy: FailurePolicy,
    execution_id: String,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let steps_token = handle.cancel.child_token();
    let halt = steps_token.child_token();
    Self {
      inner,
      handle,
      template,
      graph,
      order,
      params: Arc::new(params),
      policy,
      execution_id,
      steps_token,
      halt,
      tx,
      rx,
      dispatched: HashSet::new(),
      in_flight: 0,
      failed: false,
      cancelled: false,
      deadline_passed: false,
    }
  }

  #[instrument(
    name = "workflow_execution",
    skip(self),
    fields(
      execution_id = %self.execution_id,
      template_id = %self.template.id,
    )
  )]
  pub(crate) async fn run(mut self) {
    let deadline = self
      .params
      .timeout_ms
      .or(self.template.timeout_ms)
      .map(|ms| Instant::now() + Duration::from_millis(ms));

    self.update(|state| state.status = ExecutionStatus::Running);
    self.handle.status_tx.send_replace(ExecutionStatus::Running);
    info!(
      steps = self.order.len(),
      policy = ?self.policy,
      "workflow_started"
    );
    self.inner.notifier.notify(ExecutionEvent::WorkflowStarted {
      execution_id: self.execution_id.clone(),
      template_id: self.template.id.clone(),
    });

    let cancel = self.handle.cancel.clone();
    loop {
      self.dispatch();
      if self.in_flight == 0 {
        break;
      }

      tokio::select! {
        Some(event) = self.rx.recv() => self.apply(event),
        _ = cancel.cancelled(), if !self.cancelled => {
          warn!("workflow_cancelled");
          self.cancelled = true;
        }
        _ = wait_until(deadline), if !self.deadline_passed => {
          warn!("workflow_deadline_exceeded");
          self.deadline_passed = true;
          self.steps_token.cancel();
        }
      }
    }

    self.finish();
  }

  fn halted(&self) -> bool {
    self.cancelled
      || self.deadline_passed
      || (self.failed && self.policy == FailurePolicy::FailFast)
  }

  /// Start every ready step, in topological order, up to the parallel limit.
  fn dispatch(&mut self) {
    // The cancel branch may not have been polled yet.
    if self.handle.cancel.is_cancelled() {
      self.cancelled = true;
    }
    if self.halted() {
      return;
    }
    let max_parallel = self.inner.settings.max_parallel_steps;

    let ready: Vec<String> = {
      let state = self.lock();
      self
        .order
        .iter()
        .filter(|id| !self.dispatched.contains(*id))
        .filter(|id| state.step_status(id) == Some(StepStatus::Pending))
        .filter(|id| {
          self
            .graph
            .upstream(id)
            .iter()
            .all(|up| state.step_status(up) == Some(StepStatus::Succeeded))
        })
        .take(max_parallel.saturating_sub(self.in_flight))
        .cloned()
        .collect()
    };

    for step_id in ready {
      self.spawn_step(step_id);
    }
  }

  fn spawn_step(&mut self, step_id: String) {
    let Some(step) = self.template.get_step(&step_id).cloned() else {
      return;
    };
    // Registration guarantees an executor for every kind.
    let Some(executor) = self.inner.executors.get(step.kind.tag()) else {
      return;
    };

    let mut dependencies: Vec<&String> = self.graph.upstream(&step_id).iter().collect();
    dependencies.sort();
    let inputs: Vec<StepInput> = {
      let state = self.lock();
      dependencies
        .into_iter()
        .filter_map(|id| {
          let output = state.step(id)?.output.clone()?;
          Some(StepInput {
            step_id: id.clone(),
            output,
          })
        })
        .collect()
    };

    let timeout = step
      .timeout_duration()
      .or(self.inner.settings.default_step_timeout());
    let ctx = StepContext {
      execution_id: self.execution_id.clone(),
      step,
      inputs,
      params: self.params.clone(),
      cancel: self.steps_token.clone(),
    };

    self.dispatched.insert(step_id.clone());
    self.in_flight += 1;

    let pool = self.inner.worker_pool.clone();
    let token = self.steps_token.clone();
    let halt = self.halt.clone();
    let fail_fast = self.policy == FailurePolicy::FailFast;
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let permit = tokio::select! {
        permit = pool.acquire_owned() => permit.ok(),
        _ = halt.cancelled() => None,
      };
      let Some(permit) = permit.filter(|_| !halt.is_cancelled()) else {
        let _ = tx.send(StepEvent::Finished {
          step_id,
          result: Err(StepError::Cancelled),
          at: Utc::now(),
        });
        return;
      };

      let _ = tx.send(StepEvent::Started {
        step_id: step_id.clone(),
        at: Utc::now(),
      });
      let result = tokio::select! {
        result = run_step(executor, ctx, timeout) => result,
        _ = token.cancelled() => Err(StepError::Cancelled),
      };
      // Halt before the permit is released so no queued step slips through.
      if fail_fast && matches!(&result, Err(e) if !matches!(e, StepError::Cancelled)) {
        halt.cancel();
      }

      let _ = tx.send(StepEvent::Finished {
        step_id,
        result,
        at: Utc::now(),
      });
      drop(permit);
    });
  }

  fn apply(&mut self, event: StepEvent) {
    match event {
      StepEvent::Started { step_id, at } => {
        self.update(|state| {
          if let Some(step) = state.steps.get_mut(&step_id) {
            step.status = StepStatus::Running;
            step.started_at = Some(at);
          }
        });
        info!(step_id = %step_id, "step_started");
        self.inner.notifier.notify(ExecutionEvent::StepStarted {
          execution_id: self.execution_id.clone(),
          step_id,
        });
      }
      StepEvent::Finished {
        step_id,
        result,
        at,
      } => {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.finish_step(step_id, result, at);
      }
    }
  }

  fn finish_step(
    &mut self,
    step_id: String,
    result: Result<serde_json::Value, StepError>,
    at: DateTime<Utc>,
  ) {
    let started = self.lock().step_status(&step_id) == Some(StepStatus::Running);

    match result {
      Ok(output) => {
        self.update(|state| {
          if let Some(step) = state.steps.get_mut(&step_id) {
            step.status = StepStatus::Succeeded;
            step.output = Some(output.clone());
            step.finished_at = Some(at);
          }
        });
        info!(step_id = %step_id, "step_completed");
        self.inner.notifier.notify(ExecutionEvent::StepCompleted {
          execution_id: self.execution_id.clone(),
          step_id,
          output,
        });
      }
      Err(StepError::Cancelled) if !started => self.skip(&step_id),
      Err(error) => {
        let error = match error {
          StepError::Cancelled if self.deadline_passed && !self.cancelled => {
            StepError::DeadlineExceeded
          }
          other => other,
        };
        let report = ErrorReport::from(&error);
        self.update(|state| {
          if let Some(step) = state.steps.get_mut(&step_id) {
            step.status = StepStatus::Failed;
            step.error = Some(report);
            step.finished_at = Some(at);
          }
        });
        warn!(step_id = %step_id, error = %error, "step_failed");
        self.inner.notifier.notify(ExecutionEvent::StepFailed {
          execution_id: self.execution_id.clone(),
          step_id: step_id.clone(),
          error: error.to_string(),
        });
        self.failed = true;

        if self.policy == FailurePolicy::FailFast {
          self.halt.cancel();
        } else {
          for descendant in self.graph.descendants(&step_id) {
            self.skip(&descendant);
          }
        }
      }
    }
  }

  /// Mark a step Skipped if it has not started.
  fn skip(&self, step_id: &str) {
    let now = Utc::now();
    let skipped = self.update(|state| match state.steps.get_mut(step_id) {
      Some(step) if step.status == StepStatus::Pending => {
        step.status = StepStatus::Skipped;
        step.finished_at = Some(now);
        true
      }
      _ => false,
    });
    if skipped {
      info!(step_id = %step_id, "step_skipped");
      self.inner.notifier.notify(ExecutionEvent::StepSkipped {
        execution_id: self.execution_id.clone(),
        step_id: step_id.to_string(),
      });
    }
  }

  fn finish(self) {
    let pending: Vec<String> = {
      let state = self.lock();
      self
        .order
        .iter()
        .filter(|id| state.step_status(id) == Some(StepStatus::Pending))
        .cloned()
        .collect()
    };
    for step_id in &pending {
      self.skip(step_id);
    }

    let status = if self.cancelled {
      ExecutionStatus::Cancelled
    } else if self.failed || self.deadline_passed {
      match self.policy {
        FailurePolicy::FailFast => ExecutionStatus::Failed,
        FailurePolicy::BestEffort => ExecutionStatus::PartiallyFailed,
      }
    } else {
      ExecutionStatus::Completed
    };

    let terminals = self.graph.terminals();
    self.update(|state| {
      let outputs = terminals
        .iter()
        .filter_map(|id| {
          let step = state.step(id)?;
          if step.status != StepStatus::Succeeded {
            return None;
          }
          Some((id.clone(), step.output.clone()?))
        })
        .collect();
      let manifest = self
        .order
        .iter()
        .filter_map(|id| state.step(id).cloned())
        .collect();

      state.status = status;
      state.finished_at = Some(Utc::now());
      state.result = Some(AggregateResult { outputs, manifest });
    });

    info!(status = ?status, "workflow_finished");
    self.inner.notifier.notify(ExecutionEvent::WorkflowFinished {
      execution_id: self.execution_id.clone(),
      status,
    });
    self.handle.mark_finished();
    self.handle.status_tx.send_replace(status);
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, WorkflowExecution> {
    self.handle.lock()
  }

  fn update<T>(&self, f: impl FnOnce(&mut WorkflowExecution) -> T) -> T {
    f(&mut self.handle.lock())
  }
}

async fn wait_until(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

/// Run one executor call, bounded by the step timeout. Panics become step
/// failures.
async fn run_step(
  executor: Arc<dyn StepExecutor>,
  ctx: StepContext,
  timeout: Option<Duration>,
) -> Result<serde_json::Value, StepError> {
  let call = AssertUnwindSafe(executor.execute(&ctx)).catch_unwind();
  let outcome = match timeout {
    Some(limit) => tokio::time::timeout(limit, call)
      .await
      .map_err(|_| StepError::Timeout(limit))?,
    None => call.await,
  };
  outcome.unwrap_or(Err(StepError::Panicked))
}
