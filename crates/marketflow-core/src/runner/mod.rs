//! Step runner
//!
//! Drives one operation from `pending` to a terminal status. The runner is
//! the only writer of step state: workers report through signals and the
//! runner applies them in arrival order, publishing one event per change.
//!
//! Steps run in batches. With `config.parallel` set, consecutive
//! parallel-safe steps share a batch and a pool of `max_workers` slots;
//! every other step is a batch of its own.

mod retry;
mod worker;

pub use retry::RetryPolicy;

use crate::event_bus::EventKind;
use crate::executor::ExecutorRegistry;
use crate::manager::handle::{CancelReason, Change, OperationHandle};
use crate::operation::{FailureInfo, MetadataValue, Operation, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use worker::{StepJob, StepOutcome, StepSignal, CODE_INTERNAL_ERROR};

pub(crate) struct StepRunner {
    handle: Arc<OperationHandle>,
    executors: Arc<ExecutorRegistry>,
    retry: RetryPolicy,
    required_failed: bool,
}

impl StepRunner {
    pub(crate) fn new(
        handle: Arc<OperationHandle>,
        executors: Arc<ExecutorRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            handle,
            executors,
            retry,
            required_failed: false,
        }
    }

    /// Run on a background task inside the operation's tracing span.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let op = self.handle.snapshot();
        let span = info_span!(
            "operation",
            operation_id = %op.id,
            trace_id = %op.trace_id,
        );
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(mut self) {
        let started = self.handle.update(|op| {
            if !op.transition(Status::Running) {
                return Change::None;
            }
            Change::Publish(EventKind::OperationStarted {
                name: op.name.clone(),
                total_steps: op.steps.len(),
            })
        });
        if !started {
            debug!("Operation no longer pending, runner exiting");
            return;
        }

        let op = self.handle.snapshot();
        info!(
            operation_type = %op.operation_type,
            steps = op.steps.len(),
            parallel = op.config.parallel,
            "Operation started"
        );

        let finished = CancellationToken::new();
        let _finished_guard = finished.clone().drop_guard();
        if let Some(secs) = op.config.timeout_secs {
            self.arm_timeout(Duration::from_secs(secs), finished);
        }

        for batch in plan_batches(&op) {
            if self.handle.abort.is_cancelled() || self.handle.cancel.is_cancelled() {
                break;
            }
            if !self.run_batch(&op, &batch).await {
                debug!("Forced stop, runner exiting");
                return;
            }
            if self.required_failed {
                break;
            }
        }

        if self.handle.abort.is_cancelled() {
            return;
        }
        self.finish();
    }

    fn arm_timeout(&self, after: Duration, finished: CancellationToken) {
        let handle = Arc::clone(&self.handle);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(after) => {
                        warn!(timeout_secs = after.as_secs(), "Operation timed out, stopping");
                        handle.set_reason(CancelReason::Timeout);
                        handle.cancel.cancel();
                    }
                    _ = finished.cancelled() => {}
                }
            }
            .in_current_span(),
        );
    }

    /// Run one batch to completion. Returns false on forced stop.
    async fn run_batch(&mut self, op: &Operation, batch: &[usize]) -> bool {
        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(op.config.max_workers.max(1)));
        let mut workers = JoinSet::new();

        for &index in batch {
            let Some(step) = op.steps.get(index) else {
                continue;
            };
            let Some(executor) = self.executors.get(&step.step_type) else {
                self.apply(StepSignal::Started { index });
                self.apply(StepSignal::Finished {
                    index,
                    outcome: StepOutcome::Failed {
                        code: CODE_INTERNAL_ERROR,
                        message: format!("no executor registered for '{}'", step.step_type),
                        can_retry: false,
                    },
                });
                continue;
            };

            let job = StepJob {
                index,
                operation_id: op.id,
                trace_id: op.trace_id.clone(),
                name: step.name.clone(),
                step_type: step.step_type.clone(),
                params: step.parameters.clone(),
                max_retries: step.max_retries,
                executor,
                cancel: self.handle.cancel.clone(),
                retry: self.retry.clone(),
            };
            workers.spawn(
                job.run(Arc::clone(&slots), signal_tx.clone())
                    .in_current_span(),
            );
        }
        drop(signal_tx);

        loop {
            tokio::select! {
                biased;
                _ = self.handle.abort.cancelled() => {
                    workers.abort_all();
                    return false;
                }
                signal = signals.recv() => match signal {
                    Some(signal) => self.apply(signal),
                    None => break,
                },
            }
        }

        while workers.join_next().await.is_some() {}
        true
    }

    fn apply(&mut self, signal: StepSignal) {
        match signal {
            StepSignal::Started { index } => {
                self.handle.update(|op| {
                    let Some(step) = op.steps.get_mut(index) else {
                        return Change::None;
                    };
                    if !step.transition(Status::Running) {
                        return Change::None;
                    }
                    debug!(step = %step.name, "Step started");
                    Change::Publish(EventKind::StepStarted {
                        step: step.name.clone(),
                        step_type: step.step_type.clone(),
                        order: step.order,
                    })
                });
            }
            StepSignal::Progress { index, update } => {
                self.handle.update(|op| {
                    let Some(step) = op.steps.get_mut(index) else {
                        return Change::None;
                    };
                    if step.status != Status::Running {
                        return Change::None;
                    }
                    let percent = update.percent.min(100);
                    step.progress = percent;
                    step.metadata.extend(update.metadata);
                    let name = step.name.clone();
                    op.refresh_metrics();
                    Change::Publish(EventKind::StepProgress {
                        step: name,
                        percent,
                        message: update.message,
                        operation_progress: op.metrics.progress,
                    })
                });
            }
            StepSignal::Retrying {
                index,
                attempt,
                error,
                delay,
            } => {
                self.handle.update(|op| {
                    let Some(step) = op.steps.get_mut(index) else {
                        return Change::None;
                    };
                    if !step.transition(Status::Retrying) {
                        return Change::None;
                    }
                    step.retry_count += 1;
                    step.last_error = Some(error.clone());
                    let name = step.name.clone();
                    let max_retries = step.max_retries;
                    op.refresh_metrics();
                    Change::Publish(EventKind::StepRetrying {
                        step: name,
                        attempt,
                        max_retries,
                        error,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        operation_progress: op.metrics.progress,
                    })
                });
            }
            StepSignal::Resumed { index } => {
                self.handle.update(|op| match op.steps.get_mut(index) {
                    Some(step) => {
                        if step.transition(Status::Running) {
                            Change::Silent
                        } else {
                            Change::None
                        }
                    }
                    None => Change::None,
                });
            }
            StepSignal::Finished { index, outcome } => self.finish_step(index, outcome),
        }
    }

    fn finish_step(&mut self, index: usize, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Completed(output) => {
                self.handle.update(|op| {
                    let Some(step) = op.steps.get_mut(index) else {
                        return Change::None;
                    };
                    if !step.transition(Status::Completed) {
                        return Change::None;
                    }
                    step.metadata.extend(output.metadata);
                    if let Some(message) = output.message {
                        step.metadata
                            .insert("message".to_string(), MetadataValue::Text(message));
                    }
                    let duration_ms = match (step.started_at, step.completed_at) {
                        (Some(start), Some(end)) => {
                            u64::try_from((end - start).num_milliseconds()).ok()
                        }
                        _ => None,
                    };
                    info!(step = %step.name, duration_ms = ?duration_ms, "Step completed");
                    Change::Publish(EventKind::StepCompleted {
                        step: step.name.clone(),
                        duration_ms,
                        metadata: step.metadata.clone(),
                    })
                });
            }
            StepOutcome::Failed {
                code,
                message,
                can_retry,
            } => {
                let required_failed = self.required_failed;
                let mut failed: Option<(String, bool)> = None;
                self.handle.update(|op| {
                    let Some(step) = op.steps.get_mut(index) else {
                        return Change::None;
                    };
                    step.last_error = Some(message.clone());
                    if !step.transition(Status::Failed) {
                        return Change::None;
                    }
                    let name = step.name.clone();
                    let optional = step.optional;
                    let kind = EventKind::StepFailed {
                        step: name.clone(),
                        error_code: code.to_string(),
                        error: message.clone(),
                        retries: step.retry_count,
                        optional,
                    };
                    // The first required failure replaces an earlier optional one
                    if op.failure.is_none() || (!optional && !required_failed) {
                        op.failure = Some(FailureInfo {
                            failed_step: name.clone(),
                            error_code: code.to_string(),
                            message: message.clone(),
                            can_retry,
                        });
                    }
                    failed = Some((name, optional));
                    Change::Publish(kind)
                });

                let Some((failed_step, optional)) = failed else {
                    return;
                };
                if optional {
                    info!(step = %failed_step, "Optional step failed, continuing");
                } else {
                    self.required_failed = true;
                }
            }
            StepOutcome::Cancelled => {
                self.handle.update(|op| match op.steps.get_mut(index) {
                    Some(step) => {
                        if step.transition(Status::Cancelled) {
                            Change::Silent
                        } else {
                            Change::None
                        }
                    }
                    None => Change::None,
                });
            }
            StepOutcome::Skipped => {}
        }
    }

    /// Settle the operation's terminal status.
    ///
    /// Completed requires every step completed. Any recorded step failure,
    /// optional or not, wins over a stop request, so the operation is failed
    /// exactly when one of its steps is.
    fn finish(&mut self) {
        let stop_requested = self.handle.cancel.is_cancelled();
        let reason = self.handle.reason();
        let mut final_status = None;

        self.handle.update(|op| {
            if op.is_terminal() {
                return Change::None;
            }
            let notify = op.config.notify_on_complete;
            let all_completed = op.steps.iter().all(|s| s.status == Status::Completed);

            let status = if all_completed {
                Status::Completed
            } else if op.failure.is_some() {
                Status::Failed
            } else if stop_requested {
                Status::Cancelled
            } else {
                Status::Failed
            };
            if status == Status::Failed && op.failure.is_none() {
                op.failure = Some(fail_unsettled_step(op));
            }
            op.cancel_open_steps();
            if !op.transition(status) {
                return Change::None;
            }
            op.refresh_metrics();
            final_status = Some(status);

            let kind = match (status, op.failure.clone()) {
                (Status::Completed, _) => EventKind::OperationCompleted {
                    duration_ms: op.metrics.duration_ms,
                    notify,
                },
                (Status::Failed, Some(failure)) => EventKind::OperationFailed {
                    failed_step: failure.failed_step,
                    error_code: failure.error_code,
                    error: failure.message,
                    can_retry: failure.can_retry,
                    notify,
                },
                _ => {
                    op.set_metadata("cancel_reason", reason.as_str());
                    EventKind::OperationCancelled {
                        reason: reason.as_str().to_string(),
                        notify,
                    }
                }
            };
            Change::Publish(kind)
        });

        let op = self.handle.snapshot();
        match final_status {
            Some(Status::Completed) => info!(
                duration_ms = ?op.metrics.duration_ms,
                "Operation completed"
            ),
            Some(Status::Cancelled) => info!(reason = reason.as_str(), "Operation cancelled"),
            Some(_) => warn!(
                failed_step = ?op.failure.as_ref().map(|f| f.failed_step.as_str()),
                "Operation failed"
            ),
            None => return,
        }
        if op.config.notify_on_complete {
            info!(status = %op.status, created_by = %op.created_by, "Completion notification requested");
        }
    }
}

/// Fail the first unfinished step of an operation that ended without a
/// recorded failure or stop.
fn fail_unsettled_step(op: &mut Operation) -> FailureInfo {
    let message = "step finished without reporting an outcome".to_string();
    let mut failed_step = String::new();
    if let Some(step) = op.steps.iter_mut().find(|s| !s.status.is_terminal()) {
        if step.status == Status::Pending {
            step.transition(Status::Running);
        }
        step.last_error = Some(message.clone());
        step.transition(Status::Failed);
        failed_step = step.name.clone();
    }
    FailureInfo {
        failed_step,
        error_code: CODE_INTERNAL_ERROR.to_string(),
        message,
        can_retry: false,
    }
}

/// Group step indices into execution batches.
fn plan_batches(op: &Operation) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut open_parallel = false;
    for (index, step) in op.steps.iter().enumerate() {
        let parallel = op.config.parallel && step.parallel_safe;
        match batches.last_mut() {
            Some(batch) if parallel && open_parallel => batch.push(index),
            _ => batches.push(vec![index]),
        }
        open_parallel = parallel;
    }
    batches
}

#[cfg(test)]
mod tests;
