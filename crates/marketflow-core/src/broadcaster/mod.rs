//! StatusBroadcaster - turns raw operation events into sequenced wire
//! messages and fans them out to subscribed connections.
//!
//! The broadcaster runs as a single task. Event fan-out and subscription
//! changes are handled on that same task, which gives the snapshot-then-delta
//! guarantee: a snapshot records the version of every operation it covers,
//! and any event at or below that version is skipped for the new subscriber.

mod message;

pub use message::{
    Channel, MessageType, WebSocketMessage, OPERATIONS_CHANNEL, PROTOCOL_VERSION, SYSTEM_CHANNEL,
};

use crate::event_bus::{EventKind, EventStream, OperationEvent};
use crate::hub::subscription::Subscription;
use crate::hub::{
    ConnectionHub, DisconnectReason, HubCommand, HubCommands, MessageScope, SubscriptionFilter,
};
use crate::manager::OperationManager;
use crate::operation::Operation;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Read access to operation snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Deep copy of one operation.
    async fn snapshot(&self, id: Uuid) -> Option<Operation>;
    /// Deep copies of every registered operation.
    async fn snapshot_all(&self) -> Vec<Operation>;
}

#[async_trait]
impl SnapshotSource for OperationManager {
    async fn snapshot(&self, id: Uuid) -> Option<Operation> {
        self.get_status(id).await.ok()
    }

    async fn snapshot_all(&self) -> Vec<Operation> {
        let mut operations = self.snapshots().await;
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        operations
    }
}

/// One outgoing message before per-subscriber sequencing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub(crate) channel: String,
    pub(crate) message_type: MessageType,
    pub(crate) data: Value,
}

/// Messages produced by one event: the operation channel first, then the
/// global channel.
pub(crate) fn frames_for(event: &OperationEvent) -> [Frame; 2] {
    let op_channel = Channel::Operation(event.operation_id).to_string();
    let base = |fields: Value| -> Value {
        let mut data = json!({
            "operation_id": event.operation_id,
            "operation_type": event.operation_type,
            "version": event.version,
        });
        if let (Some(target), Value::Object(extra)) = (data.as_object_mut(), fields) {
            target.extend(extra);
        }
        data
    };
    let both = |message_type: MessageType, data: Value| {
        [
            Frame {
                channel: op_channel.clone(),
                message_type,
                data: data.clone(),
            },
            Frame {
                channel: OPERATIONS_CHANNEL.to_string(),
                message_type,
                data,
            },
        ]
    };

    match &event.kind {
        EventKind::OperationStarted { name, total_steps } => both(
            MessageType::OperationStart,
            base(json!({ "name": name, "status": "running", "total_steps": total_steps })),
        ),
        EventKind::StepStarted {
            step,
            step_type,
            order,
        } => both(
            MessageType::StepStart,
            base(json!({ "step": step, "step_type": step_type, "order": order, "status": "running" })),
        ),
        EventKind::StepProgress {
            step,
            percent,
            message,
            operation_progress,
        } => [
            Frame {
                channel: op_channel.clone(),
                message_type: MessageType::StepProgress,
                data: base(json!({
                    "step": step,
                    "status": "running",
                    "progress": percent,
                    "message": message,
                    "operation_progress": operation_progress,
                })),
            },
            Frame {
                channel: OPERATIONS_CHANNEL.to_string(),
                message_type: MessageType::OperationProgress,
                data: base(json!({ "step": step, "progress": operation_progress })),
            },
        ],
        EventKind::StepRetrying {
            step,
            attempt,
            max_retries,
            error,
            delay_ms,
            operation_progress,
        } => [
            Frame {
                channel: op_channel.clone(),
                message_type: MessageType::StepProgress,
                data: base(json!({
                    "step": step,
                    "status": "retrying",
                    "attempt": attempt,
                    "max_retries": max_retries,
                    "error": error,
                    "delay_ms": delay_ms,
                    "operation_progress": operation_progress,
                })),
            },
            Frame {
                channel: OPERATIONS_CHANNEL.to_string(),
                message_type: MessageType::OperationProgress,
                data: base(json!({ "step": step, "status": "retrying", "progress": operation_progress })),
            },
        ],
        EventKind::StepCompleted {
            step,
            duration_ms,
            metadata,
        } => both(
            MessageType::StepComplete,
            base(json!({
                "step": step,
                "status": "completed",
                "duration_ms": duration_ms,
                "metadata": metadata,
            })),
        ),
        EventKind::StepFailed {
            step,
            error_code,
            error,
            retries,
            optional,
        } => both(
            MessageType::StepFailed,
            base(json!({
                "step": step,
                "status": "failed",
                "error_code": error_code,
                "error": error,
                "retries": retries,
                "optional": optional,
            })),
        ),
        EventKind::OperationCompleted {
            duration_ms,
            notify,
        } => both(
            MessageType::OperationComplete,
            base(json!({ "status": "completed", "duration_ms": duration_ms, "notify": notify })),
        ),
        EventKind::OperationFailed {
            failed_step,
            error_code,
            error,
            can_retry,
            notify,
        } => both(
            MessageType::OperationFailed,
            base(json!({
                "status": "failed",
                "failed_step": failed_step,
                "error_code": error_code,
                "error": error,
                "can_retry": can_retry,
                "notify": notify,
            })),
        ),
        EventKind::OperationCancelled { reason, notify } => both(
            MessageType::OperationCancelled,
            base(json!({ "status": "cancelled", "reason": reason, "notify": notify })),
        ),
    }
}

fn scope_of(op: &Operation) -> MessageScope<'_> {
    MessageScope {
        operation_id: op.id,
        operation_type: &op.operation_type,
        symbols: &op.symbols,
    }
}

/// Event-to-wire fan-out task
pub struct StatusBroadcaster {
    hub: Arc<ConnectionHub>,
    snapshots: Arc<dyn SnapshotSource>,
}

impl StatusBroadcaster {
    /// Create a broadcaster delivering through `hub`.
    #[must_use]
    pub fn new(hub: Arc<ConnectionHub>, snapshots: Arc<dyn SnapshotSource>) -> Self {
        Self { hub, snapshots }
    }

    /// Process events and subscription commands until `shutdown` fires or
    /// the event stream ends. Events still queued at shutdown are flushed.
    pub async fn run(
        self,
        mut events: EventStream,
        mut commands: HubCommands,
        shutdown: CancellationToken,
    ) {
        info!("Status broadcaster started");
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    while let Some(event) = events.try_recv() {
                        self.dispatch(&event).await;
                    }
                    break;
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_open = false,
                },
                event = events.recv() => match event {
                    Some(event) => self.dispatch(&event).await,
                    None => break,
                },
            }
        }

        info!("Status broadcaster stopped");
    }

    /// Deliver one event to every matching subscription.
    async fn dispatch(&self, event: &OperationEvent) {
        let frames = frames_for(event);
        let scope = MessageScope {
            operation_id: event.operation_id,
            operation_type: &event.operation_type,
            symbols: &event.symbols,
        };

        for connection in self.hub.connections().await {
            for frame in &frames {
                let message = connection
                    .with_subscription(&frame.channel, |sub| {
                        if !sub.accepts(&scope, event.version) {
                            return None;
                        }
                        Some(
                            WebSocketMessage::new(
                                frame.message_type,
                                frame.channel.clone(),
                                sub.advance(),
                                frame.data.clone(),
                            )
                            .with_trace_id(event.trace_id.clone())
                            .with_timestamp(event.timestamp),
                        )
                    })
                    .flatten();
                let Some(message) = message else {
                    continue;
                };

                if let Err(overflow) = connection.push(message) {
                    warn!(
                        conn_id = %connection.id(),
                        operation_id = %event.operation_id,
                        message_type = %frame.message_type,
                        error = %overflow,
                        "Cannot queue critical message, disconnecting client"
                    );
                    self.hub
                        .disconnect(connection.id(), DisconnectReason::Overflow)
                        .await;
                    break;
                }
            }
        }
    }

    async fn handle_command(&self, command: HubCommand) {
        match command {
            HubCommand::Subscribe {
                connection_id,
                request_id,
                channel,
                filter,
            } => {
                self.subscribe(connection_id, request_id, channel, filter)
                    .await;
            }
            HubCommand::Unsubscribe {
                connection_id,
                request_id,
                channel,
            } => {
                let Some(connection) = self.hub.connection(connection_id).await else {
                    return;
                };
                if connection.unsubscribe(&channel) {
                    debug!(conn_id = %connection_id, channel = %channel, "Unsubscribed");
                    connection.send_control(
                        MessageType::Ack,
                        json!({ "request_id": request_id, "action": "unsubscribe", "channel": channel }),
                    );
                } else {
                    connection.send_error(
                        request_id.as_deref(),
                        "NOT_SUBSCRIBED",
                        &format!("not subscribed to '{}'", channel),
                    );
                }
            }
        }
    }

    async fn subscribe(
        &self,
        connection_id: Uuid,
        request_id: Option<String>,
        channel: Channel,
        filter: SubscriptionFilter,
    ) {
        let Some(connection) = self.hub.connection(connection_id).await else {
            return;
        };

        let (data, baselines, trace_id) = match channel {
            Channel::Operation(id) => {
                let Some(op) = self.snapshots.snapshot(id).await else {
                    connection.send_error(
                        request_id.as_deref(),
                        "NOT_FOUND",
                        &format!("operation {} not found", id),
                    );
                    return;
                };
                let baselines = HashMap::from([(op.id, op.version)]);
                let trace_id = op.trace_id.clone();
                match serde_json::to_value(&op) {
                    Ok(data) => (data, baselines, Some(trace_id)),
                    Err(e) => {
                        connection.send_error(request_id.as_deref(), "INTERNAL_ERROR", &e.to_string());
                        return;
                    }
                }
            }
            Channel::Operations => {
                let operations: Vec<Operation> = self
                    .snapshots
                    .snapshot_all()
                    .await
                    .into_iter()
                    .filter(|op| filter.matches(&scope_of(op)))
                    .collect();
                let baselines = operations.iter().map(|op| (op.id, op.version)).collect();
                (json!({ "operations": operations }), baselines, None)
            }
        };

        connection.send_control(
            MessageType::Ack,
            json!({ "request_id": request_id, "action": "subscribe", "channel": channel.to_string() }),
        );
        let sequence = connection.subscribe(Subscription::new(channel, filter, baselines));

        let mut snapshot =
            WebSocketMessage::new(MessageType::Snapshot, channel.to_string(), sequence, data);
        if let Some(trace_id) = trace_id {
            snapshot = snapshot.with_trace_id(trace_id);
        }
        if connection.push(snapshot).is_err() {
            warn!(conn_id = %connection_id, "Cannot queue snapshot, disconnecting client");
            self.hub
                .disconnect(connection_id, DisconnectReason::Overflow)
                .await;
            return;
        }
        debug!(conn_id = %connection_id, channel = %channel, "Subscribed");
    }
}

#[cfg(test)]
mod tests;
