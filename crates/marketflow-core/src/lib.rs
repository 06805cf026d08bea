//! MarketFlow Core - Operation Orchestration Engine
//!
//! Runs long-lived data-pipeline operations (scraping, processing,
//! indexing, analysis) as ordered steps and streams their progress to
//! connected clients:
//! - Operation: the operation model, its status machine and requests
//! - Manager: starting, querying, stopping and cleaning up operations
//! - Runner: step execution with retries, cancellation and timeouts
//! - Event bus: lossless hand-off of state changes
//! - Broadcaster: sequenced snapshot-then-delta streams per subscription
//! - Hub: client connections with bounded outbound queues

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broadcaster;
pub mod error;
pub mod event_bus;
pub mod executor;
pub mod hub;
pub mod manager;
pub mod operation;
mod runner;
pub mod testing;

pub use broadcaster::{Channel, MessageType, SnapshotSource, StatusBroadcaster, WebSocketMessage};
pub use error::{Error, Result};
pub use event_bus::{EventBus, EventKind, EventStream, OperationEvent};
pub use executor::{
    ExecutorRegistry, ProgressSink, ProgressUpdate, StepContext, StepError, StepExecutor,
    StepOutput, StepParams, WorkflowCatalog,
};
pub use hub::{Connection, ConnectionHub, DisconnectReason, HubConfig, SubscriptionFilter};
pub use manager::{CancelReason, ManagerConfig, OperationManager};
pub use operation::{
    Mode, Operation, OperationConfig, OperationFilter, OperationRequest, OperationSummary, Status,
    Step, StepSpec,
};
pub use runner::RetryPolicy;
