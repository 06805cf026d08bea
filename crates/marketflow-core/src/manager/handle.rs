use crate::event_bus::{EventBus, EventKind, OperationEvent};
use crate::operation::{Operation, Status};
use std::sync::OnceLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why an operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Graceful `stop`
    User,
    /// `stop` with `force`
    Forced,
    /// `timeout_secs` elapsed
    Timeout,
}

impl CancelReason {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Forced => "forced",
            Self::Timeout => "timeout",
        }
    }
}

/// Outcome of a state mutation closure.
pub(crate) enum Change {
    /// Nothing changed
    None,
    /// State changed without a visible event
    Silent,
    /// State changed; publish this event
    Publish(EventKind),
}

/// Registry entry for one operation.
///
/// The state lives in a `watch` channel: writers mutate it in place with
/// `send_if_modified`, readers clone the borrowed value. Events are published
/// while the write lock is held, so event order always equals mutation order
/// and every event's `version` matches the state it describes.
pub(crate) struct OperationHandle {
    state: watch::Sender<Operation>,
    bus: EventBus,
    /// Graceful stop: handed to executors, checked between steps
    pub(crate) cancel: CancellationToken,
    /// Forced stop: aborts in-flight executor tasks
    pub(crate) abort: CancellationToken,
    reason: OnceLock<CancelReason>,
}

impl OperationHandle {
    pub(crate) fn new(operation: Operation, bus: EventBus) -> Self {
        let (state, _) = watch::channel(operation);
        Self {
            state,
            bus,
            cancel: CancellationToken::new(),
            abort: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    /// Deep copy of the current state.
    pub(crate) fn snapshot(&self) -> Operation {
        self.state.borrow().clone()
    }

    pub(crate) fn status(&self) -> Status {
        self.state.borrow().status
    }

    /// Mutate the operation. Bumps `version` and refreshes metrics whenever
    /// the closure reports a change.
    pub(crate) fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Operation) -> Change,
    {
        let bus = &self.bus;
        self.state.send_if_modified(|op| match f(op) {
            Change::None => false,
            Change::Silent => {
                op.version += 1;
                op.refresh_metrics();
                true
            }
            Change::Publish(kind) => {
                op.version += 1;
                op.refresh_metrics();
                bus.publish(OperationEvent::new(op, kind));
                true
            }
        })
    }

    /// Record the cancellation reason; the first caller wins.
    pub(crate) fn set_reason(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
    }

    pub(crate) fn reason(&self) -> CancelReason {
        self.reason.get().copied().unwrap_or(CancelReason::User)
    }

    /// Resolve once the operation reaches a terminal status.
    pub(crate) async fn wait_terminal(&self) -> Operation {
        let mut rx = self.state.subscribe();
        let finished = match rx.wait_for(|op| op.is_terminal()).await {
            Ok(op) => op.clone(),
            // Sender lives as long as `self`
            Err(_) => self.snapshot(),
        };
        finished
    }
}
