//! Wire envelope and channel names.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Protocol revision announced in the `connect` message
pub const PROTOCOL_VERSION: &str = "1.0";

/// Global channel carrying every operation's lifecycle
pub const OPERATIONS_CHANNEL: &str = "operations";
/// Per-connection control channel (`connect`, `ack`, `error`)
pub const SYSTEM_CHANNEL: &str = "system";

/// Message `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Runner picked up the operation
    #[serde(rename = "operation:start")]
    OperationStart,
    /// Operation-wide progress
    #[serde(rename = "operation:progress")]
    OperationProgress,
    /// Operation completed
    #[serde(rename = "operation:complete")]
    OperationComplete,
    /// Operation failed
    #[serde(rename = "operation:failed")]
    OperationFailed,
    /// Operation cancelled
    #[serde(rename = "operation:cancelled")]
    OperationCancelled,
    /// Step started
    #[serde(rename = "step:start")]
    StepStart,
    /// Step progress or retry notice
    #[serde(rename = "step:progress")]
    StepProgress,
    /// Step completed
    #[serde(rename = "step:complete")]
    StepComplete,
    /// Step exhausted its retries
    #[serde(rename = "step:failed")]
    StepFailed,
    /// Full state sent on subscribe
    #[serde(rename = "snapshot")]
    Snapshot,
    /// Handshake
    #[serde(rename = "connect")]
    Connect,
    /// Client subscribe request
    #[serde(rename = "subscribe")]
    Subscribe,
    /// Client unsubscribe request
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    /// Request acknowledged
    #[serde(rename = "ack")]
    Ack,
    /// Request rejected
    #[serde(rename = "error")]
    Error,
}

impl MessageType {
    /// Every type, in announcement order.
    pub const ALL: [MessageType; 15] = [
        Self::OperationStart,
        Self::OperationProgress,
        Self::OperationComplete,
        Self::OperationFailed,
        Self::OperationCancelled,
        Self::StepStart,
        Self::StepProgress,
        Self::StepComplete,
        Self::StepFailed,
        Self::Snapshot,
        Self::Connect,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Ack,
        Self::Error,
    ];

    /// Returns the wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OperationStart => "operation:start",
            Self::OperationProgress => "operation:progress",
            Self::OperationComplete => "operation:complete",
            Self::OperationFailed => "operation:failed",
            Self::OperationCancelled => "operation:cancelled",
            Self::StepStart => "step:start",
            Self::StepProgress => "step:progress",
            Self::StepComplete => "step:complete",
            Self::StepFailed => "step:failed",
            Self::Snapshot => "snapshot",
            Self::Connect => "connect",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }

    /// May be discarded under backpressure.
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::OperationProgress | Self::StepProgress)
    }

    /// Ends an operation's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OperationComplete | Self::OperationFailed | Self::OperationCancelled
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON envelope for every server-to-client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketMessage {
    /// Unique message id
    pub id: Uuid,
    /// Message type
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Channel the message belongs to
    pub channel: String,
    /// When the underlying change happened
    pub timestamp: DateTime<Utc>,
    /// Position in the subscriber's stream for this channel, starting at 1
    pub sequence: u64,
    /// Correlation id of the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Type-specific payload
    pub data: Value,
}

impl WebSocketMessage {
    /// Build a message stamped now.
    #[must_use]
    pub fn new(
        message_type: MessageType,
        channel: impl Into<String>,
        sequence: u64,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            channel: channel.into(),
            timestamp: Utc::now(),
            sequence,
            trace_id: None,
            data,
        }
    }

    /// Attach a trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A subscribable channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every operation
    Operations,
    /// A single operation
    Operation(Uuid),
}

impl Channel {
    /// Whether an operation's events flow on this channel.
    #[must_use]
    pub fn carries(&self, operation_id: Uuid) -> bool {
        match self {
            Self::Operations => true,
            Self::Operation(id) => *id == operation_id,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operations => f.write_str(OPERATIONS_CHANNEL),
            Self::Operation(id) => write!(f, "operation:{}", id),
        }
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == OPERATIONS_CHANNEL {
            return Ok(Self::Operations);
        }
        let id = s
            .strip_prefix("operation:")
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                Error::validation(
                    "channel",
                    format!("unknown channel '{}'; expected 'operations' or 'operation:<uuid>'", s),
                )
            })?;
        Ok(Self::Operation(id))
    }
}
