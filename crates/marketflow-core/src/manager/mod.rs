//! Operation manager - the control surface of the engine.
//!
//! Validates requests, owns the registry of operations and spawns one step
//! runner per accepted operation. Reads always return deep copies of the
//! operation state; callers never share mutable state with the runner.

pub(crate) mod handle;

pub use handle::CancelReason;

use crate::event_bus::{EventBus, EventKind};
use crate::executor::{ExecutorRegistry, GenericFields, WorkflowCatalog};
use crate::operation::{
    ConfigDefaults, Metadata, Operation, OperationConfig, OperationFilter, OperationMetrics,
    OperationRequest, OperationSummary, Status, Step, StepSpec,
};
use crate::runner::{RetryPolicy, StepRunner};
use crate::{Error, Result};
use chrono::Utc;
use handle::{Change, OperationHandle};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Backoff between step attempts
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Retry cap when a request sets none
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Worker pool size when a request sets none
    #[serde(default = "default_max_workers")]
    pub default_max_workers: usize,
}

fn default_max_retries() -> u32 {
    ConfigDefaults::default().max_retries
}

fn default_max_workers() -> usize {
    ConfigDefaults::default().max_workers
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_max_retries: default_max_retries(),
            default_max_workers: default_max_workers(),
        }
    }
}

impl ManagerConfig {
    fn defaults(&self) -> ConfigDefaults {
        ConfigDefaults {
            max_retries: self.default_max_retries,
            max_workers: self.default_max_workers.max(1),
        }
    }
}

/// Registry and lifecycle control for operations
pub struct OperationManager {
    operations: RwLock<HashMap<Uuid, Arc<OperationHandle>>>,
    executors: Arc<ExecutorRegistry>,
    catalog: WorkflowCatalog,
    bus: EventBus,
    config: ManagerConfig,
}

impl OperationManager {
    /// Create a manager with the default catalog and settings.
    #[must_use]
    pub fn new(executors: ExecutorRegistry, bus: EventBus) -> Self {
        Self::with_config(executors, bus, ManagerConfig::default())
    }

    /// Create a manager with explicit settings.
    #[must_use]
    pub fn with_config(executors: ExecutorRegistry, bus: EventBus, config: ManagerConfig) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            executors: Arc::new(executors),
            catalog: WorkflowCatalog::default(),
            bus,
            config,
        }
    }

    /// Replace the workflow catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Registered executors.
    #[must_use]
    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// Validate a request, register the operation in `pending` and schedule
    /// its runner. Returns before any step executes.
    pub async fn start(&self, request: OperationRequest) -> Result<Uuid> {
        let operation = self.build_operation(request)?;
        let id = operation.id;
        info!(
            operation_id = %id,
            operation_type = %operation.operation_type,
            steps = operation.steps.len(),
            created_by = %operation.created_by,
            trace_id = %operation.trace_id,
            "Operation accepted"
        );

        let handle = Arc::new(OperationHandle::new(operation, self.bus.clone()));
        self.operations.write().await.insert(id, Arc::clone(&handle));

        StepRunner::new(handle, Arc::clone(&self.executors), self.config.retry.clone()).spawn();
        Ok(id)
    }

    /// Deep copy of the operation's current state.
    pub async fn get_status(&self, id: Uuid) -> Result<Operation> {
        Ok(self.handle(id).await?.snapshot())
    }

    /// Stop an operation.
    ///
    /// A pending operation is cancelled on the spot and never reaches an
    /// executor. A running one is asked to stop: executors observe the
    /// cancellation token and no further step starts. With `force` the
    /// operation is settled immediately and in-flight executors are aborted;
    /// it ends failed instead of cancelled if a step already failed.
    pub async fn stop(&self, id: Uuid, force: bool) -> Result<Operation> {
        let handle = self.handle(id).await?;
        let status = handle.status();
        if status.is_terminal() {
            return Err(Error::Conflict(format!(
                "operation {} is already {}",
                id, status
            )));
        }

        let reason = if force {
            CancelReason::Forced
        } else {
            CancelReason::User
        };
        handle.set_reason(reason);

        let settled = handle.update(|op| {
            if op.is_terminal() || (!force && op.status != Status::Pending) {
                return Change::None;
            }
            op.cancel_open_steps();
            let notify = op.config.notify_on_complete;
            // A step that already failed keeps the operation failed
            if let Some(failure) = op.failure.clone() {
                if !op.transition(Status::Failed) {
                    return Change::None;
                }
                return Change::Publish(EventKind::OperationFailed {
                    failed_step: failure.failed_step,
                    error_code: failure.error_code,
                    error: failure.message,
                    can_retry: failure.can_retry,
                    notify,
                });
            }
            if !op.transition(Status::Cancelled) {
                return Change::None;
            }
            op.set_metadata("cancel_reason", reason.as_str());
            Change::Publish(EventKind::OperationCancelled {
                reason: reason.as_str().to_string(),
                notify,
            })
        });

        if force {
            handle.abort.cancel();
        }
        handle.cancel.cancel();

        info!(
            operation_id = %id,
            force = force,
            settled = settled,
            "Stop requested"
        );
        Ok(handle.snapshot())
    }

    /// Summaries of operations matching `filter`, newest first.
    pub async fn list(&self, filter: &OperationFilter) -> Vec<OperationSummary> {
        let handles: Vec<Arc<OperationHandle>> =
            self.operations.read().await.values().cloned().collect();

        let mut summaries: Vec<OperationSummary> = handles
            .iter()
            .map(|h| h.snapshot())
            .filter(|op| filter.matches(op))
            .map(|op| op.summary())
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        summaries
    }

    /// Remove a finished operation from the registry.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let mut operations = self.operations.write().await;
        let handle = operations
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("operation {}", id)))?;
        let status = handle.status();
        if !status.is_terminal() {
            return Err(Error::Conflict(format!(
                "operation {} is {}; stop it before deleting",
                id, status
            )));
        }
        operations.remove(&id);
        debug!(operation_id = %id, "Operation deleted");
        Ok(())
    }

    /// Wait until the operation reaches a terminal status.
    pub async fn wait(&self, id: Uuid) -> Result<Operation> {
        let handle = self.handle(id).await?;
        Ok(handle.wait_terminal().await)
    }

    /// Snapshots of every registered operation.
    pub async fn snapshots(&self) -> Vec<Operation> {
        let handles: Vec<Arc<OperationHandle>> =
            self.operations.read().await.values().cloned().collect();
        handles.iter().map(|h| h.snapshot()).collect()
    }

    /// Number of operations not yet finished.
    pub async fn active_count(&self) -> usize {
        self.operations
            .read()
            .await
            .values()
            .filter(|h| !h.status().is_terminal())
            .count()
    }

    /// Ask every unfinished operation to stop (process shutdown).
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<OperationHandle>> =
            self.operations.read().await.values().cloned().collect();
        let mut stopped = 0usize;
        for handle in handles {
            if handle.status().is_terminal() {
                continue;
            }
            handle.set_reason(CancelReason::User);
            handle.update(|op| {
                if op.status != Status::Pending {
                    return Change::None;
                }
                op.cancel_open_steps();
                if !op.transition(Status::Cancelled) {
                    return Change::None;
                }
                op.set_metadata("cancel_reason", CancelReason::User.as_str());
                Change::Publish(EventKind::OperationCancelled {
                    reason: CancelReason::User.as_str().to_string(),
                    notify: op.config.notify_on_complete,
                })
            });
            handle.cancel.cancel();
            stopped += 1;
        }
        info!(stopped = stopped, "Operation manager shutting down");
    }

    async fn handle(&self, id: Uuid) -> Result<Arc<OperationHandle>> {
        self.operations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("operation {}", id)))
    }

    fn build_operation(&self, request: OperationRequest) -> Result<Operation> {
        let operation_type = request.operation_type.trim().to_string();
        if operation_type.is_empty() {
            return Err(Error::validation("type", "operation type is required"));
        }

        let date_range = request.date_range()?;
        let mut config = OperationConfig::from_options(&request.config, self.config.defaults())?;
        if let Some(mode) = request.mode {
            config.mode = mode;
        }

        let specs: Vec<StepSpec> = if request.steps.is_empty() {
            self.catalog
                .steps_for(&operation_type)
                .map(<[StepSpec]>::to_vec)
                .ok_or_else(|| {
                    Error::validation(
                        "steps",
                        format!(
                            "no steps given and no workflow defined for type '{}'",
                            operation_type
                        ),
                    )
                })?
        } else {
            request.steps
        };
        self.validate_steps(&specs)?;

        let generic = GenericFields {
            date_range,
            mode: config.mode,
            symbols: request.symbols.clone(),
        };
        let steps: Vec<Step> = specs
            .into_iter()
            .enumerate()
            .map(|(order, spec)| {
                let parameters = self
                    .executors
                    .mapping(&spec.step_type)
                    .cloned()
                    .unwrap_or_default()
                    .resolve(&generic, &config.extra, &spec.parameters);
                Step {
                    id: Uuid::new_v4(),
                    name: spec.name,
                    step_type: spec.step_type,
                    status: Status::Pending,
                    order: u32::try_from(order).unwrap_or(u32::MAX),
                    parallel_safe: spec.parallel_safe,
                    optional: spec.optional,
                    max_retries: spec.max_retries.unwrap_or(config.max_retries),
                    parameters,
                    started_at: None,
                    completed_at: None,
                    retry_count: 0,
                    last_error: None,
                    progress: 0,
                    metadata: Metadata::new(),
                }
            })
            .collect();

        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| operation_type.clone());

        let mut operation = Operation {
            id: Uuid::new_v4(),
            name,
            operation_type,
            mode: config.mode,
            status: Status::Pending,
            steps,
            config,
            symbols: request.symbols,
            date_range,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            created_by: request.created_by,
            trace_id: request
                .trace_id
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            metrics: OperationMetrics::default(),
            metadata: Metadata::new(),
            failure: None,
            version: 0,
        };
        operation.refresh_metrics();
        Ok(operation)
    }

    fn validate_steps(&self, specs: &[StepSpec]) -> Result<()> {
        if specs.is_empty() {
            return Err(Error::validation("steps", "at least one step is required"));
        }
        let mut seen = HashSet::new();
        for spec in specs {
            if spec.name.trim().is_empty() {
                return Err(Error::validation("steps.name", "step name must not be empty"));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::validation(
                    "steps.name",
                    format!("duplicate step name '{}'", spec.name),
                ));
            }
            if !self.executors.has(&spec.step_type) {
                return Err(Error::validation(
                    "steps.type",
                    format!("unknown step type '{}'", spec.step_type),
                ));
            }
        }
        Ok(())
    }
}
