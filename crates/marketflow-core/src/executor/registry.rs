use super::params::{standard_mappings, ParameterMapping};
use super::StepExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct RegisteredExecutor {
    executor: Arc<dyn StepExecutor>,
    mapping: ParameterMapping,
}

/// Registry of executors keyed by step type
pub struct ExecutorRegistry {
    executors: HashMap<String, RegisteredExecutor>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor. Built-in step types (`scraping`, `processing`,
    /// `indexing`, `analysis`) get their standard parameter mapping; any
    /// other type receives the generic fields unchanged.
    pub fn register(&mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        let step_type = step_type.into();
        let mapping = standard_mappings()
            .remove(step_type.as_str())
            .unwrap_or_default();
        self.register_with_mapping(step_type, executor, mapping);
    }

    /// Register an executor with an explicit parameter mapping.
    pub fn register_with_mapping(
        &mut self,
        step_type: impl Into<String>,
        executor: Arc<dyn StepExecutor>,
        mapping: ParameterMapping,
    ) {
        let step_type = step_type.into();
        debug!(step_type = %step_type, "Registering step executor");
        self.executors
            .insert(step_type, RegisteredExecutor { executor, mapping });
    }

    /// Get the executor for a step type
    #[must_use]
    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).map(|r| r.executor.clone())
    }

    /// Get the parameter mapping for a step type
    #[must_use]
    pub fn mapping(&self, step_type: &str) -> Option<&ParameterMapping> {
        self.executors.get(step_type).map(|r| &r.mapping)
    }

    /// Check if a step type is registered
    #[must_use]
    pub fn has(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    /// List registered step types, sorted
    #[must_use]
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
