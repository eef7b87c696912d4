//! Execution events and notifiers for observability.
//!
//! Events are emitted as an execution progresses so consumers can stream
//! progress, persist state or drive a UI.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::execution::ExecutionStatus;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
  /// The scheduler picked up the execution.
  WorkflowStarted {
    execution_id: String,
    template_id: String,
  },

  /// A step acquired a worker and began executing.
  StepStarted {
    execution_id: String,
    step_id: String,
  },

  /// A step completed successfully.
  StepCompleted {
    execution_id: String,
    step_id: String,
    output: serde_json::Value,
  },

  /// A step failed.
  StepFailed {
    execution_id: String,
    step_id: String,
    error: String,
  },

  /// A step will not run.
  StepSkipped {
    execution_id: String,
    step_id: String,
  },

  /// The execution reached a terminal status.
  WorkflowFinished {
    execution_id: String,
    status: ExecutionStatus,
  },
}

/// Trait for receiving execution events.
///
/// The engine calls `notify` for each event from its scheduler tasks;
/// implementations must not block.
pub trait ExecutionNotifier: Send + Sync + 'static {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a scheduler; volume is a handful
  // of events per step.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}
