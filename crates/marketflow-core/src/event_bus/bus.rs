use super::types::OperationEvent;
use tokio::sync::mpsc;

/// Publishing half of the event bus.
///
/// Backed by an unbounded `tokio::mpsc` channel: `publish` never blocks the
/// runner, and no event is lost between runner and broadcaster, so sequence
/// numbers derived downstream have no gaps.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<OperationEvent>,
}

/// Consuming half of the event bus. Owned by the status broadcaster.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<OperationEvent>,
}

impl EventBus {
    /// Create a connected bus/stream pair.
    #[must_use]
    pub fn channel() -> (Self, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, EventStream { receiver })
    }

    /// Publish an event.
    ///
    /// Returns false when the stream has been dropped; the event is then
    /// discarded, which is harmless since nobody is listening.
    pub fn publish(&self, event: OperationEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Whether the consuming side is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl EventStream {
    /// Receive the next event; `None` once every publisher is dropped.
    pub async fn recv(&mut self) -> Option<OperationEvent> {
        self.receiver.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<OperationEvent> {
        self.receiver.try_recv().ok()
    }
}
