use crate::operation::{Metadata, Operation};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A raw state change of one operation.
///
/// `version` is the operation's version right after the change; the
/// broadcaster compares it against a subscriber's snapshot baseline.
#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
    /// Operation identifier
    pub operation_id: Uuid,
    /// Workflow type (used by subscription filters)
    pub operation_type: String,
    /// Symbols in scope (used by subscription filters)
    pub symbols: Vec<String>,
    /// Correlation id
    pub trace_id: String,
    /// Operation version after this change
    pub version: u64,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub kind: EventKind,
}

impl OperationEvent {
    /// Build an event stamped from the operation's current state.
    #[must_use]
    pub fn new(op: &Operation, kind: EventKind) -> Self {
        Self {
            operation_id: op.id,
            operation_type: op.operation_type.clone(),
            symbols: op.symbols.clone(),
            trace_id: op.trace_id.clone(),
            version: op.version,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Whether this event ends the operation.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::OperationCompleted { .. }
                | EventKind::OperationFailed { .. }
                | EventKind::OperationCancelled { .. }
        )
    }
}

/// Lifecycle events emitted by the step runner.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// Runner picked up the operation
    OperationStarted {
        /// Display name
        name: String,
        /// Number of steps
        total_steps: usize,
    },
    /// A step began its first attempt
    StepStarted {
        /// Step name
        step: String,
        /// Step type
        step_type: String,
        /// Position in the sequence
        order: u32,
    },
    /// Executor reported progress
    StepProgress {
        /// Step name
        step: String,
        /// Step percent complete
        percent: u8,
        /// Optional status line
        message: Option<String>,
        /// Operation-wide percent complete
        operation_progress: u8,
    },
    /// An attempt failed and another will follow after a delay
    StepRetrying {
        /// Step name
        step: String,
        /// Attempt that just failed (1-based)
        attempt: u32,
        /// Retry cap
        max_retries: u32,
        /// Error from the failed attempt
        error: String,
        /// Backoff before the next attempt
        delay_ms: u64,
        /// Operation-wide percent complete
        operation_progress: u8,
    },
    /// A step finished successfully
    StepCompleted {
        /// Step name
        step: String,
        /// Step wall time
        duration_ms: Option<u64>,
        /// Executor-reported data
        metadata: Metadata,
    },
    /// A step exhausted its retries
    StepFailed {
        /// Step name
        step: String,
        /// Machine-readable code
        error_code: String,
        /// Last error message
        error: String,
        /// Retries performed
        retries: u32,
        /// Whether the operation continues anyway
        optional: bool,
    },
    /// Every step completed
    OperationCompleted {
        /// Operation wall time
        duration_ms: Option<u64>,
        /// `notify_on_complete` was requested
        notify: bool,
    },
    /// A step failure ended the operation
    OperationFailed {
        /// First failed step
        failed_step: String,
        /// Machine-readable code
        error_code: String,
        /// Last error message
        error: String,
        /// Whether re-running may succeed
        can_retry: bool,
        /// `notify_on_complete` was requested
        notify: bool,
    },
    /// The operation was stopped
    OperationCancelled {
        /// `user`, `forced` or `timeout`
        reason: String,
        /// `notify_on_complete` was requested
        notify: bool,
    },
}

impl EventKind {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OperationStarted { .. } => "operation_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepProgress { .. } => "step_progress",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::OperationCompleted { .. } => "operation_completed",
            Self::OperationFailed { .. } => "operation_failed",
            Self::OperationCancelled { .. } => "operation_cancelled",
        }
    }

    /// Step the event refers to, if any.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step, .. }
            | Self::StepProgress { step, .. }
            | Self::StepRetrying { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}
