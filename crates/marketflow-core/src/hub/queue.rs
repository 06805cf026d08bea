//! Bounded per-connection outbound queue.
//!
//! Pushing never blocks. When the queue is full, progress messages are
//! discarded oldest-first to make room; a message that may not be dropped
//! evicts the oldest progress message instead, and if there is none the push
//! fails with [`QueueOverflow`] so the caller can disconnect the client.

use crate::broadcaster::WebSocketMessage;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;

/// A non-droppable message found the queue full of non-droppable messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outbound queue overflow (capacity {capacity})")]
pub struct QueueOverflow {
    /// Queue capacity
    pub capacity: usize,
}

/// What happened to a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended without loss
    Queued,
    /// Appended after discarding the oldest progress message
    EvictedOldest,
    /// The pushed progress message itself was discarded
    DroppedNew,
    /// The queue is closed; the message was discarded
    Closed,
}

struct QueueState {
    items: VecDeque<WebSocketMessage>,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO with a drop-oldest-progress policy
pub struct OutboundQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue without waiting.
    pub fn push(&self, message: WebSocketMessage) -> Result<PushOutcome, QueueOverflow> {
        let mut state = self.lock();
        if state.closed {
            return Ok(PushOutcome::Closed);
        }

        let outcome = if state.items.len() < self.capacity {
            PushOutcome::Queued
        } else if let Some(pos) = state
            .items
            .iter()
            .position(|m| m.message_type.is_droppable())
        {
            state.items.remove(pos);
            state.dropped += 1;
            PushOutcome::EvictedOldest
        } else if message.message_type.is_droppable() {
            state.dropped += 1;
            return Ok(PushOutcome::DroppedNew);
        } else {
            return Err(QueueOverflow {
                capacity: self.capacity,
            });
        };

        state.items.push_back(message);
        drop(state);
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Next message; waits while empty. Returns `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<WebSocketMessage> {
        loop {
            {
                let mut state = self.lock();
                if let Some(message) = state.items.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Next message without waiting.
    pub fn try_pop(&self) -> Option<WebSocketMessage> {
        self.lock().items.pop_front()
    }

    /// Refuse new messages; already queued ones can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Close and throw away everything queued. Returns how many messages
    /// were discarded.
    pub fn discard(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            state.closed = true;
            let discarded = state.items.len();
            state.items.clear();
            discarded
        };
        self.notify.notify_one();
        discarded
    }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Messages waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Progress messages discarded so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
