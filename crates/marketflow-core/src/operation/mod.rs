//! Operation data model
//!
//! An [`Operation`] is one workflow run made of ordered [`Step`]s. Both share
//! the [`Status`] state machine. Steps are fixed at creation: never reordered,
//! added or removed.

/// Open-ended metadata maps.
pub mod metadata;
/// Operation and step aggregates.
pub mod model;
/// Workflow requests and configuration options.
pub mod request;
/// Shared status state machine.
pub mod status;

pub use metadata::{Metadata, MetadataValue};
pub use model::{
    FailureInfo, Operation, OperationFilter, OperationMetrics, OperationSummary, Step,
};
pub use request::{ConfigDefaults, DateRange, Mode, OperationConfig, OperationRequest, StepSpec};
pub use status::Status;
