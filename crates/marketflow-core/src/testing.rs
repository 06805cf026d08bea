//! Scripted executors for tests and local demos.

use crate::executor::{
    ProgressSink, ProgressUpdate, StepContext, StepError, StepExecutor, StepOutput, StepParams,
};
use crate::operation::MetadataValue;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Behavior {
    Succeed,
    FailAlways(String),
    FailTimes(u32, String),
    Permanent(String),
    Panic(String),
    /// Run until the cancellation token fires
    UntilCancelled,
    /// Report cancellation although nothing stopped the operation
    GiveUp,
    /// Never return, ignoring cancellation
    Hang,
}

/// Executor whose behavior is fixed at construction.
///
/// Counts invocations, tracks peak concurrency and records the parameters of
/// the last call.
#[derive(Debug)]
pub struct ScriptedExecutor {
    behavior: Behavior,
    delay: Duration,
    progress: Vec<u8>,
    output: Vec<(String, MetadataValue)>,
    calls: AtomicU32,
    active: AtomicUsize,
    peak: AtomicUsize,
    last_params: Mutex<Option<StepParams>>,
}

impl ScriptedExecutor {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            progress: Vec::new(),
            output: Vec::new(),
            calls: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        }
    }

    /// Always succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }

    /// Always fails with a retryable error.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::FailAlways(message.into()))
    }

    /// Fails the first `times` invocations, then succeeds.
    #[must_use]
    pub fn failing_times(times: u32, message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::FailTimes(times, message.into()))
    }

    /// Always fails with a non-retryable error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::Permanent(message.into()))
    }

    /// Panics on every invocation.
    #[must_use]
    pub fn panicking(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::Panic(message.into()))
    }

    /// Runs until the operation is stopped, then reports cancellation.
    #[must_use]
    pub fn until_cancelled() -> Self {
        Self::with_behavior(Behavior::UntilCancelled)
    }

    /// Reports cancellation without the operation being stopped.
    #[must_use]
    pub fn giving_up() -> Self {
        Self::with_behavior(Behavior::GiveUp)
    }

    /// Never finishes and ignores cancellation.
    #[must_use]
    pub fn hanging() -> Self {
        Self::with_behavior(Behavior::Hang)
    }

    /// Sleep before producing the result (cancellable).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report these percentages before finishing.
    #[must_use]
    pub fn with_progress(mut self, steps: &[u8]) -> Self {
        self.progress = steps.to_vec();
        self
    }

    /// Return this metadata entry on success.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.output.push((key.into(), value.into()));
        self
    }

    /// Number of times `execute` was called.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping invocations observed.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Parameters of the most recent invocation.
    #[must_use]
    pub fn last_params(&self) -> Option<StepParams> {
        self.last_params.lock().ok().and_then(|p| p.clone())
    }

    async fn perform(&self, call: u32, ctx: &StepContext, progress: &ProgressSink) -> Result<StepOutput, StepError> {
        for percent in &self.progress {
            progress.report(ProgressUpdate::percent(*percent));
        }

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }

        match &self.behavior {
            Behavior::Succeed => Ok(self.success()),
            Behavior::FailAlways(message) => Err(StepError::failed(message.clone())),
            Behavior::FailTimes(times, message) => {
                if call <= *times {
                    Err(StepError::failed(message.clone()))
                } else {
                    Ok(self.success())
                }
            }
            Behavior::Permanent(message) => Err(StepError::permanent(message.clone())),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::UntilCancelled => {
                ctx.cancel.cancelled().await;
                Err(StepError::Cancelled)
            }
            Behavior::GiveUp => Err(StepError::Cancelled),
            Behavior::Hang => std::future::pending().await,
        }
    }

    fn success(&self) -> StepOutput {
        self.output
            .iter()
            .fold(StepOutput::new(), |out, (k, v)| out.with_metadata(k.clone(), v.clone()))
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        ctx: StepContext,
        params: StepParams,
        progress: ProgressSink,
    ) -> Result<StepOutput, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut last) = self.last_params.lock() {
            *last = Some(params);
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let result = self.perform(call, &ctx, &progress).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
