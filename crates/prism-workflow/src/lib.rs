//! Prism Workflow
//!
//! The declarative side of multi-step analyses. A `WorkflowTemplate` is an
//! ordered list of typed steps with dependencies between them; once validated
//! it is guaranteed to:
//! - reference only steps it defines
//! - be acyclic
//! - read dependency outputs only from steps it depends on
//!
//! `WorkflowTemplateCatalog` holds validated templates by id. Execution lives in
//! `prism-engine`.

mod builtin;
mod catalog;
mod error;
mod graph;
mod step;
mod template;

pub use builtin::templates as builtin_templates;
pub use catalog::{WorkflowTemplateCatalog, load_templates, parse_templates};
pub use error::TemplateError;
pub use graph::Graph;
pub use step::{
  DerivedOperation, InsightSynthesisStep, QueryStep, StatisticalTestStep, StepDefinition, StepKind,
  StepKindTag, TestMethod,
};
pub use template::{FailurePolicy, TemplateSummary, WorkflowTemplate};
