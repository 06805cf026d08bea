use super::metadata::{Metadata, MetadataValue};
use super::request::{DateRange, Mode, OperationConfig};
use super::status::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One stage of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique step ID
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Registered step type
    pub step_type: String,
    /// Current status
    pub status: Status,
    /// Position in the execution sequence
    pub order: u32,
    /// May share the worker pool with adjacent parallel-safe steps
    pub parallel_safe: bool,
    /// Failure does not stop the operation
    pub optional: bool,
    /// Retry cap for this step
    pub max_retries: u32,
    /// Resolved executor parameters
    pub parameters: BTreeMap<String, Value>,
    /// When the first attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Retries performed so far
    pub retry_count: u32,
    /// Most recent error message
    pub last_error: Option<String>,
    /// Progress, 0-100
    pub progress: u8,
    /// Executor-reported data
    pub metadata: Metadata,
}

impl Step {
    /// Apply a status transition. Returns false (and changes nothing) when
    /// the state machine forbids it.
    pub(crate) fn transition(&mut self, next: Status) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == Status::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            if next == Status::Completed {
                self.progress = 100;
            }
        }
        self.status = next;
        true
    }
}

/// Why an operation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Name of the first step that exhausted its retries
    pub failed_step: String,
    /// Machine-readable error code
    pub error_code: String,
    /// Last error message
    pub message: String,
    /// Whether re-running the operation may succeed
    pub can_retry: bool,
}

/// Aggregate counters over an operation's steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    /// Number of steps
    pub total_steps: usize,
    /// Steps in `completed`
    pub completed_steps: usize,
    /// Steps in `failed`
    pub failed_steps: usize,
    /// Steps in `cancelled`
    pub cancelled_steps: usize,
    /// Retries across all steps
    pub total_retries: u32,
    /// Mean step progress, 0-100
    pub progress: u8,
    /// Wall time from start to completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// One workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Workflow type
    pub operation_type: String,
    /// Incremental or full
    pub mode: Mode,
    /// Current status
    pub status: Status,
    /// Steps in execution order
    pub steps: Vec<Step>,
    /// Parsed configuration
    pub config: OperationConfig,
    /// Ticker symbols in scope (empty = all)
    pub symbols: Vec<String>,
    /// Requested date range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the runner started
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached
    pub completed_at: Option<DateTime<Utc>>,
    /// Requesting user
    pub created_by: String,
    /// Correlation id threaded through logs and events
    pub trace_id: String,
    /// Aggregate counters
    pub metrics: OperationMetrics,
    /// Open key/value reporting data
    pub metadata: Metadata,
    /// Set when the operation failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Incremented on every mutation
    pub version: u64,
}

impl Operation {
    /// Channel carrying this operation's events.
    #[must_use]
    pub fn channel(&self) -> String {
        format!("operation:{}", self.id)
    }

    /// Whether the operation has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Find a step by name.
    #[must_use]
    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Apply a status transition to the operation itself.
    pub(crate) fn transition(&mut self, next: Status) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == Status::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        true
    }

    /// Cancel every step that has not reached a terminal status.
    pub(crate) fn cancel_open_steps(&mut self) {
        for step in &mut self.steps {
            if !step.status.is_terminal() {
                step.transition(Status::Cancelled);
            }
        }
    }

    /// Record a metadata entry.
    pub(crate) fn set_metadata(&mut self, key: &str, value: impl Into<MetadataValue>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Recompute `metrics` from the steps.
    pub(crate) fn refresh_metrics(&mut self) {
        let total = self.steps.len();
        let count = |status: Status| self.steps.iter().filter(|s| s.status == status).count();
        let progress_sum: usize = self.steps.iter().map(|s| usize::from(s.progress)).sum();

        self.metrics = OperationMetrics {
            total_steps: total,
            completed_steps: count(Status::Completed),
            failed_steps: count(Status::Failed),
            cancelled_steps: count(Status::Cancelled),
            total_retries: self.steps.iter().map(|s| s.retry_count).sum(),
            progress: if total == 0 {
                0
            } else {
                u8::try_from(progress_sum / total).unwrap_or(100)
            },
            duration_ms: match (self.started_at, self.completed_at) {
                (Some(start), Some(end)) => {
                    Some(u64::try_from((end - start).num_milliseconds()).unwrap_or(0))
                }
                _ => None,
            },
        };
    }

    /// Terminal outcome as a `Result`: `Ok` only for `completed`.
    pub fn outcome(&self) -> crate::Result<()> {
        match self.status {
            Status::Completed => Ok(()),
            Status::Cancelled => Err(crate::Error::Cancelled),
            Status::Failed => {
                let failure = self.failure.clone().unwrap_or(FailureInfo {
                    failed_step: String::new(),
                    error_code: "unknown".to_string(),
                    message: "operation failed".to_string(),
                    can_retry: false,
                });
                Err(crate::Error::Execution {
                    step: failure.failed_step,
                    code: failure.error_code,
                    message: failure.message,
                })
            }
            other => Err(crate::Error::Conflict(format!(
                "operation {} is still {}",
                self.id, other
            ))),
        }
    }

    /// Lightweight view for list endpoints.
    #[must_use]
    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            id: self.id,
            name: self.name.clone(),
            operation_type: self.operation_type.clone(),
            status: self.status,
            progress: self.metrics.progress,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Summary view of an operation (for list endpoints).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    /// Operation ID
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Workflow type
    pub operation_type: String,
    /// Current status
    pub status: Status,
    /// Mean step progress
    pub progress: u8,
    /// Requesting user
    pub created_by: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

/// Criteria for `OperationManager::list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationFilter {
    /// Only operations in this status
    #[serde(default)]
    pub status: Option<Status>,
    /// Only operations of this type
    #[serde(default, rename = "type")]
    pub operation_type: Option<String>,
    /// Only operations created by this user
    #[serde(default)]
    pub created_by: Option<String>,
    /// Maximum number of results
    #[serde(default)]
    pub limit: Option<usize>,
}

impl OperationFilter {
    /// Whether an operation satisfies the filter.
    #[must_use]
    pub fn matches(&self, op: &Operation) -> bool {
        self.status.map_or(true, |s| op.status == s)
            && self
                .operation_type
                .as_deref()
                .map_or(true, |t| op.operation_type == t)
            && self
                .created_by
                .as_deref()
                .map_or(true, |u| op.created_by == u)
    }
}
