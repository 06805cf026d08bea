//! Parameter transformation
//!
//! Requests speak in generic fields (`from`, `to`, `mode`, `symbols`); each
//! executor expects its own names (`from_date`, `start_date`, ...). Every step
//! type declares its renames once in a [`ParameterMapping`], so the runner
//! never special-cases a step type.

use super::StepParams;
use crate::operation::{DateRange, Mode};
use serde_json::Value;
use std::collections::BTreeMap;

/// Request-level values available to every step.
#[derive(Debug, Clone, Default)]
pub struct GenericFields {
    /// Requested date range
    pub date_range: Option<DateRange>,
    /// Run mode
    pub mode: Mode,
    /// Symbols in scope
    pub symbols: Vec<String>,
}

impl GenericFields {
    fn to_params(&self) -> StepParams {
        let mut params = StepParams::new();
        if let Some(range) = self.date_range {
            params.insert("from".to_string(), Value::String(range.from.to_string()));
            params.insert("to".to_string(), Value::String(range.to.to_string()));
        }
        params.insert("mode".to_string(), Value::String(self.mode.as_str().to_string()));
        if !self.symbols.is_empty() {
            params.insert(
                "symbols".to_string(),
                Value::Array(self.symbols.iter().cloned().map(Value::String).collect()),
            );
        }
        params
    }
}

/// Declarative field renames for one step type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMapping {
    renames: BTreeMap<String, String>,
    dropped: Vec<String>,
}

impl ParameterMapping {
    /// Identity mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename generic field `from` to `to`.
    #[must_use]
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.insert(from.into(), to.into());
        self
    }

    /// Do not pass a generic field to this step type.
    #[must_use]
    pub fn drop_field(mut self, field: impl Into<String>) -> Self {
        self.dropped.push(field.into());
        self
    }

    /// Name the executor expects for a generic field.
    #[must_use]
    pub fn target_name<'a>(&'a self, field: &'a str) -> &'a str {
        self.renames.get(field).map_or(field, String::as_str)
    }

    /// Resolve the final parameters.
    ///
    /// Precedence (later wins): generic request fields, renamed; global
    /// config pass-through options; per-step overrides.
    #[must_use]
    pub fn resolve(
        &self,
        generic: &GenericFields,
        config_extra: &BTreeMap<String, Value>,
        overrides: &BTreeMap<String, Value>,
    ) -> StepParams {
        let mut params = StepParams::new();
        for (field, value) in generic.to_params() {
            if self.dropped.iter().any(|d| d == &field) {
                continue;
            }
            params.insert(self.target_name(&field).to_string(), value);
        }
        for (key, value) in config_extra {
            params.insert(key.clone(), value.clone());
        }
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
        params
    }
}

/// Mappings for the built-in pipeline stages.
#[must_use]
pub fn standard_mappings() -> BTreeMap<&'static str, ParameterMapping> {
    let mut table = BTreeMap::new();
    table.insert(
        "scraping",
        ParameterMapping::new()
            .rename("from", "from_date")
            .rename("to", "to_date"),
    );
    table.insert(
        "processing",
        ParameterMapping::new()
            .rename("from", "start_date")
            .rename("to", "end_date"),
    );
    table.insert(
        "indexing",
        ParameterMapping::new()
            .rename("from", "start_date")
            .rename("to", "end_date")
            .rename("symbols", "constituents"),
    );
    table.insert(
        "analysis",
        ParameterMapping::new()
            .rename("from", "period_start")
            .rename("to", "period_end")
            .rename("symbols", "tickers"),
    );
    table
}
