//! EventBus - internal channel carrying raw operation state changes.
//!
//! Step runners publish an [`OperationEvent`] for every visible state change;
//! the status broadcaster is the single consumer and turns them into wire
//! messages.

/// Core event bus implementation (unbounded mpsc channel).
pub mod bus;
/// Event type definitions for the operation lifecycle.
pub mod types;

pub use bus::{EventBus, EventStream};
pub use types::{EventKind, OperationEvent};
