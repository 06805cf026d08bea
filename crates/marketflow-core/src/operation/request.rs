//! Workflow requests and configuration options.

use crate::error::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Whether a run processes only new data or rebuilds everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Only fetch/process data missing since the last run
    #[default]
    Incremental,
    /// Rebuild the whole date range
    Full,
}

impl Mode {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
        }
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First day
    pub from: NaiveDate,
    /// Last day
    pub to: NaiveDate,
}

/// One requested step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Display name, unique within the operation
    pub name: String,
    /// Registered step type (selects the executor and parameter mapping)
    #[serde(rename = "type")]
    pub step_type: String,
    /// May run concurrently with adjacent parallel-safe steps
    #[serde(default)]
    pub parallel_safe: bool,
    /// Failure does not stop the operation
    #[serde(default)]
    pub optional: bool,
    /// Per-step retry cap (falls back to `config.max_retries`)
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Per-step parameter overrides
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl StepSpec {
    /// Create a step of the given type.
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            parallel_safe: false,
            optional: false,
            max_retries: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Mark the step as safe to run in the worker pool.
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    /// Mark the step as optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Override the retry cap for this step.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Add a parameter override.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

fn default_created_by() -> String {
    "anonymous".to_string()
}

/// A request to start a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Display name (defaults to the operation type)
    #[serde(default)]
    pub name: Option<String>,
    /// Workflow type, e.g. `full_pipeline` or `scraping`
    #[serde(rename = "type")]
    pub operation_type: String,
    /// Run mode; overrides `config.mode` when set
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Start of the requested date range
    #[serde(default)]
    pub from: Option<NaiveDate>,
    /// End of the requested date range
    #[serde(default)]
    pub to: Option<NaiveDate>,
    /// Ticker symbols in scope (empty = all)
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Explicit steps; when empty the workflow catalog supplies them
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Raw configuration options
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    /// Requesting user
    #[serde(default = "default_created_by")]
    pub created_by: String,
    /// Correlation id; generated when absent
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl OperationRequest {
    /// Create an empty request of the given type.
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            name: None,
            operation_type: operation_type.into(),
            mode: None,
            from: None,
            to: None,
            symbols: Vec::new(),
            steps: Vec::new(),
            config: BTreeMap::new(),
            created_by: default_created_by(),
            trace_id: None,
        }
    }

    /// Append a step.
    #[must_use]
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Set a configuration option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Set the date range.
    #[must_use]
    pub fn with_date_range(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Restrict to a symbol set.
    #[must_use]
    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    /// Set the requesting user.
    #[must_use]
    pub fn with_created_by(mut self, user: impl Into<String>) -> Self {
        self.created_by = user.into();
        self
    }

    /// Validated date range, if both ends are present.
    pub fn date_range(&self) -> Result<Option<DateRange>> {
        match (self.from, self.to) {
            (Some(from), Some(to)) if from > to => Err(Error::validation(
                "from",
                format!("start date {} is after end date {}", from, to),
            )),
            (Some(from), Some(to)) => Ok(Some(DateRange { from, to })),
            (None, None) => Ok(None),
            (Some(_), None) => Err(Error::validation("to", "end date is required with 'from'")),
            (None, Some(_)) => Err(Error::validation("from", "start date is required with 'to'")),
        }
    }
}

/// Defaults applied when a request omits an option.
#[derive(Debug, Clone, Copy)]
pub struct ConfigDefaults {
    /// Default per-step retry cap
    pub max_retries: u32,
    /// Default worker pool size
    pub max_workers: usize,
}

impl Default for ConfigDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_workers: 4,
        }
    }
}

/// Typed view of the recognized configuration options.
///
/// Unrecognized keys are kept in `extra` and merged into every step's
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Incremental or full run
    pub mode: Mode,
    /// Per-step retry cap
    pub max_retries: u32,
    /// Run parallel-safe steps in the worker pool
    pub parallel: bool,
    /// Worker pool size for parallel batches
    pub max_workers: usize,
    /// Flag terminal events for user notification
    pub notify_on_complete: bool,
    /// Cancel the run after this many seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Pass-through options
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl OperationConfig {
    /// Parse and type-check raw options.
    pub fn from_options(
        options: &BTreeMap<String, Value>,
        defaults: ConfigDefaults,
    ) -> Result<Self> {
        let mut config = Self {
            mode: Mode::default(),
            max_retries: defaults.max_retries,
            parallel: false,
            max_workers: defaults.max_workers,
            notify_on_complete: false,
            timeout_secs: None,
            extra: BTreeMap::new(),
        };

        for (key, value) in options {
            match key.as_str() {
                "mode" => {
                    config.mode = serde_json::from_value(value.clone()).map_err(|_| {
                        Error::validation("config.mode", "expected 'incremental' or 'full'")
                    })?;
                }
                "max_retries" => {
                    config.max_retries = value
                        .as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| {
                            Error::validation("config.max_retries", "expected a non-negative integer")
                        })?;
                }
                "parallel" => {
                    config.parallel = value
                        .as_bool()
                        .ok_or_else(|| Error::validation("config.parallel", "expected a boolean"))?;
                }
                "max_workers" => {
                    config.max_workers = value
                        .as_u64()
                        .and_then(|v| usize::try_from(v).ok())
                        .filter(|v| *v >= 1)
                        .ok_or_else(|| {
                            Error::validation("config.max_workers", "expected an integer >= 1")
                        })?;
                }
                "notify_on_complete" => {
                    config.notify_on_complete = value.as_bool().ok_or_else(|| {
                        Error::validation("config.notify_on_complete", "expected a boolean")
                    })?;
                }
                "timeout_secs" => {
                    let secs = value.as_u64().filter(|v| *v > 0).ok_or_else(|| {
                        Error::validation("config.timeout_secs", "expected a positive integer")
                    })?;
                    config.timeout_secs = Some(secs);
                }
                _ => {
                    config.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(config)
    }
}
