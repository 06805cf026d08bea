//! Step executors - the pluggable business logic behind each step type.
//!
//! The engine only depends on the [`StepExecutor`] contract. Implementations
//! (scraping, spreadsheet processing, index building, analytics) live outside
//! this crate and are registered per step type in an [`ExecutorRegistry`].

/// Named workflow templates.
pub mod catalog;
/// Declarative parameter renaming per step type.
pub mod params;
/// Step type -> executor registry.
pub mod registry;

pub use catalog::WorkflowCatalog;
pub use params::{GenericFields, ParameterMapping};
pub use registry::ExecutorRegistry;

use crate::operation::Metadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Resolved parameters handed to an executor.
pub type StepParams = BTreeMap<String, Value>;

/// Execution context for one attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Operation being executed
    pub operation_id: Uuid,
    /// Step name
    pub step_name: String,
    /// Step type
    pub step_type: String,
    /// Correlation id
    pub trace_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancelled when the operation is stopped. Executors must observe it
    /// during long-running work.
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Progress report from an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Percent complete, 0-100
    pub percent: u8,
    /// Optional human-readable status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Metadata to merge into the step
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl ProgressUpdate {
    /// Create a percent-only update.
    #[must_use]
    pub fn percent(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
            message: None,
            metadata: Metadata::new(),
        }
    }

    /// Attach a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Non-blocking progress callback handed to executors.
///
/// Reports are forwarded to the runner task; `report` never waits.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    /// A sink that discards every report.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Report progress. Silently ignored once the step has finished.
    pub fn report(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

/// Successful executor result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Data merged into the step's metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Optional summary line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StepOutput {
    /// Empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::operation::MetadataValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Executor error
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Failure that may succeed on retry (network, locked file, ...)
    #[error("{0}")]
    Failed(String),

    /// Failure that retrying cannot fix (bad input, missing source)
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The executor observed cancellation and stopped early
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Retryable failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Non-retryable failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Whether the retry policy applies.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Contract implemented by every step type.
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    /// Perform one attempt of the step.
    async fn execute(
        &self,
        ctx: StepContext,
        params: StepParams,
        progress: ProgressSink,
    ) -> Result<StepOutput, StepError>;
}
