//! Named workflow templates.
//!
//! A request that names an operation type but lists no steps is expanded from
//! the catalog. The default catalog knows the four pipeline stages on their
//! own and the `full_pipeline` chain.

use crate::operation::StepSpec;
use std::collections::HashMap;

/// Operation type -> ordered step template
#[derive(Debug, Clone)]
pub struct WorkflowCatalog {
    templates: HashMap<String, Vec<StepSpec>>,
}

impl Default for WorkflowCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        for stage in ["scraping", "processing", "indexing", "analysis"] {
            catalog.define(stage, vec![StepSpec::new(stage, stage)]);
        }
        catalog.define(
            "full_pipeline",
            vec![
                StepSpec::new("scraping", "scraping"),
                StepSpec::new("processing", "processing"),
                StepSpec::new("indexing", "indexing"),
                StepSpec::new("analysis", "analysis").optional(),
            ],
        );
        catalog
    }
}

impl WorkflowCatalog {
    /// Catalog without templates.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Add or replace a template.
    pub fn define(&mut self, operation_type: impl Into<String>, steps: Vec<StepSpec>) {
        self.templates.insert(operation_type.into(), steps);
    }

    /// Steps for an operation type, if defined.
    #[must_use]
    pub fn steps_for(&self, operation_type: &str) -> Option<&[StepSpec]> {
        self.templates.get(operation_type).map(Vec::as_slice)
    }
}
