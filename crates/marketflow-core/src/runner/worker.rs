//! One step's attempts, executed on a worker task.
//!
//! Each attempt runs the executor on a child task so that a panic surfaces
//! as a `JoinError` instead of tearing down the runner. Results travel back
//! to the runner as [`StepSignal`]s; the worker never touches operation state.

use super::retry::RetryPolicy;
use crate::executor::{
    ProgressSink, ProgressUpdate, StepContext, StepError, StepExecutor, StepOutput, StepParams,
};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Retryable executor failure
pub(crate) const CODE_EXECUTION_FAILED: &str = "execution_failed";
/// Executor declared the failure permanent
pub(crate) const CODE_PERMANENT_FAILURE: &str = "permanent_failure";
/// Executor panicked or the engine could not run it
pub(crate) const CODE_INTERNAL_ERROR: &str = "internal_error";

/// Final result of a step.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    Completed(StepOutput),
    Failed {
        code: &'static str,
        message: String,
        can_retry: bool,
    },
    Cancelled,
    /// Stop arrived while the step waited for a worker slot
    Skipped,
}

/// Worker -> runner notifications, applied in arrival order.
#[derive(Debug)]
pub(crate) enum StepSignal {
    Started {
        index: usize,
    },
    Progress {
        index: usize,
        update: ProgressUpdate,
    },
    Retrying {
        index: usize,
        attempt: u32,
        error: String,
        delay: Duration,
    },
    Resumed {
        index: usize,
    },
    Finished {
        index: usize,
        outcome: StepOutcome,
    },
}

enum AttemptResult {
    Completed(StepOutput),
    Failed {
        code: &'static str,
        message: String,
        retryable: bool,
    },
    Cancelled,
}

/// Everything a worker needs to run one step.
pub(crate) struct StepJob {
    pub(crate) index: usize,
    pub(crate) operation_id: Uuid,
    pub(crate) trace_id: String,
    pub(crate) name: String,
    pub(crate) step_type: String,
    pub(crate) params: StepParams,
    pub(crate) max_retries: u32,
    pub(crate) executor: Arc<dyn StepExecutor>,
    pub(crate) cancel: CancellationToken,
    pub(crate) retry: RetryPolicy,
}

impl StepJob {
    /// Wait for a worker slot, run the step, report the outcome.
    pub(crate) async fn run(self, slots: Arc<Semaphore>, signals: mpsc::UnboundedSender<StepSignal>) {
        let index = self.index;
        let Ok(permit) = slots.acquire_owned().await else {
            let _ = signals.send(StepSignal::Finished {
                index,
                outcome: StepOutcome::Skipped,
            });
            return;
        };

        let outcome = if self.cancel.is_cancelled() {
            StepOutcome::Skipped
        } else {
            self.attempts(&signals).await
        };
        drop(permit);

        let _ = signals.send(StepSignal::Finished { index, outcome });
    }

    async fn attempts(&self, signals: &mpsc::UnboundedSender<StepSignal>) -> StepOutcome {
        let index = self.index;
        let _ = signals.send(StepSignal::Started { index });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (code, message, retryable) = match self.attempt(attempt, signals).await {
                AttemptResult::Completed(output) => return StepOutcome::Completed(output),
                AttemptResult::Cancelled => return StepOutcome::Cancelled,
                AttemptResult::Failed {
                    code,
                    message,
                    retryable,
                } => (code, message, retryable),
            };

            // An attempt that fails after a stop request is treated as stopped
            if self.cancel.is_cancelled() {
                return StepOutcome::Cancelled;
            }

            let retries_done = attempt - 1;
            if !retryable || retries_done >= self.max_retries {
                warn!(
                    step = %self.name,
                    attempts = attempt,
                    error_code = code,
                    error = %message,
                    "Step failed"
                );
                return StepOutcome::Failed {
                    code,
                    message,
                    can_retry: retryable,
                };
            }

            let delay = self.retry.delay_for(retries_done);
            warn!(
                step = %self.name,
                attempt = attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Step attempt failed, retrying"
            );
            let _ = signals.send(StepSignal::Retrying {
                index,
                attempt,
                error: message,
                delay,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    debug!(step = %self.name, "Stop requested during retry backoff");
                    return StepOutcome::Cancelled;
                }
            }
            let _ = signals.send(StepSignal::Resumed { index });
        }
    }

    async fn attempt(
        &self,
        attempt: u32,
        signals: &mpsc::UnboundedSender<StepSignal>,
    ) -> AttemptResult {
        let index = self.index;
        let ctx = StepContext {
            operation_id: self.operation_id,
            step_name: self.name.clone(),
            step_type: self.step_type.clone(),
            trace_id: self.trace_id.clone(),
            attempt,
            cancel: self.cancel.clone(),
        };
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let executor = Arc::clone(&self.executor);
        let params = self.params.clone();

        // Dropping the set aborts the executor (forced stop)
        let mut task = JoinSet::new();
        task.spawn(async move {
            executor
                .execute(ctx, params, ProgressSink::new(progress_tx))
                .await
        });

        let joined = loop {
            tokio::select! {
                Some(update) = progress_rx.recv() => {
                    let _ = signals.send(StepSignal::Progress { index, update });
                }
                joined = task.join_next() => break joined,
            }
        };
        // Reports sent just before the executor returned
        while let Ok(update) = progress_rx.try_recv() {
            let _ = signals.send(StepSignal::Progress { index, update });
        }

        match joined {
            Some(Ok(Ok(output))) => AttemptResult::Completed(output),
            Some(Ok(Err(StepError::Cancelled))) if self.cancel.is_cancelled() => {
                AttemptResult::Cancelled
            }
            // Cancelled on its own: nothing asked the step to stop
            Some(Ok(Err(StepError::Cancelled))) => AttemptResult::Failed {
                code: CODE_INTERNAL_ERROR,
                message: "executor cancelled without a stop request".to_string(),
                retryable: false,
            },
            Some(Ok(Err(e))) => AttemptResult::Failed {
                code: if e.is_retryable() {
                    CODE_EXECUTION_FAILED
                } else {
                    CODE_PERMANENT_FAILURE
                },
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
            Some(Err(e)) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(
                    step = %self.name,
                    step_type = %self.step_type,
                    attempt = attempt,
                    error = %message,
                    "Step executor panicked"
                );
                AttemptResult::Failed {
                    code: CODE_INTERNAL_ERROR,
                    message: format!("executor panicked: {}", message),
                    retryable: true,
                }
            }
            Some(Err(_)) | None => AttemptResult::Cancelled,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
