//! Prism Workflow Engine
//!
//! Runs `WorkflowTemplate`s. Each execution gets its own scheduler task that
//! dispatches ready steps as their dependencies succeed, bounded per execution
//! by `max_parallel_steps` and across executions by a shared worker pool.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                         │
//! │  - register_template / start / status / cancel / wait       │
//! │  - owns templates, live executions, worker pool             │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ one per execution
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                            │
//! │  - ready set, dispatch, failure policy, deadline            │
//! │  - completion channel from step tasks                       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ by step kind
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutorRegistry                       │
//! │  - query (via QueryOptimizer), derived analysis,            │
//! │    statistical test, insight synthesis                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let executors = ExecutorRegistry::standard(optimizer, None, tester, synthesizer);
//! let engine = WorkflowEngine::new(settings.engine.clone(), executors);
//! for template in prism_workflow::builtin_templates() {
//!   engine.register_template(template)?;
//! }
//!
//! let id = engine.start("regional_revenue_overview", StartParams::default())?;
//! let execution = engine.wait(&id).await?;
//! ```

mod collaborators;
mod derived;
mod engine;
mod error;
mod events;
mod execution;
mod executor;
mod input;
mod query;
mod scheduler;

pub use collaborators::{
  InsightSynthesisExecutor, InsightSynthesizer, StatisticalTestExecutor, StatisticalTester,
};
pub use derived::DerivedAnalysisExecutor;
pub use engine::WorkflowEngine;
pub use error::{EngineError, StepError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use execution::{
  AggregateResult, ErrorReport, ExecutionStatus, StartParams, StepResult, StepStatus,
  WorkflowExecution,
};
pub use executor::{ExecutorRegistry, StepContext, StepExecutor, StepInput};
pub use input::{resolve_filters, template_context};
pub use query::QueryStepExecutor;
