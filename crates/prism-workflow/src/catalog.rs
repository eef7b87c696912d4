use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::builtin;
use crate::error::TemplateError;
use crate::template::{TemplateSummary, WorkflowTemplate};

/// In-memory registry of validated templates, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct WorkflowTemplateCatalog {
  templates: BTreeMap<String, Arc<WorkflowTemplate>>,
}

impl WorkflowTemplateCatalog {
  pub fn new() -> Self {
    Self::default()
  }

  /// A catalog holding the built-in analysis templates.
  pub fn with_builtins() -> Result<Self, TemplateError> {
    let mut catalog = Self::new();
    for template in builtin::templates() {
      catalog.register(template)?;
    }
    Ok(catalog)
  }

  /// Validate and add a template. Ids are never replaced.
  pub fn register(
    &mut self,
    template: WorkflowTemplate,
  ) -> Result<Arc<WorkflowTemplate>, TemplateError> {
    if self.templates.contains_key(&template.id) {
      return Err(TemplateError::DuplicateTemplate(template.id));
    }
    template.validate()?;

    info!(
      template_id = %template.id,
      steps = template.steps.len(),
      "template_registered"
    );
    let template = Arc::new(template);
    self
      .templates
      .insert(template.id.clone(), template.clone());
    Ok(template)
  }

  pub fn get(&self, template_id: &str) -> Result<Arc<WorkflowTemplate>, TemplateError> {
    self
      .templates
      .get(template_id)
      .cloned()
      .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))
  }

  pub fn contains(&self, template_id: &str) -> bool {
    self.templates.contains_key(template_id)
  }

  /// Summaries ordered by template id.
  pub fn list(&self) -> Vec<TemplateSummary> {
    self.templates.values().map(|t| t.summary()).collect()
  }

  pub fn len(&self) -> usize {
    self.templates.len()
  }

  pub fn is_empty(&self) -> bool {
    self.templates.is_empty()
  }
}

/// Parse one template object or an array of them.
pub fn parse_templates(json: &str) -> Result<Vec<WorkflowTemplate>, TemplateError> {
  let value: serde_json::Value = serde_json::from_str(json)?;
  let templates = if value.is_array() {
    serde_json::from_value(value)?
  } else {
    vec![serde_json::from_value(value)?]
  };
  Ok(templates)
}

/// Read and parse a JSON template file.
pub fn load_templates(path: &Path) -> Result<Vec<WorkflowTemplate>, TemplateError> {
  let json = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  parse_templates(&json)
}
