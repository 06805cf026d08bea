use super::*;
use crate::event_bus::EventBus;
use crate::executor::ExecutorRegistry;
use crate::hub::{Connection, HubConfig};
use crate::manager::ManagerConfig;
use crate::operation::{OperationRequest, StepSpec};
use crate::runner::RetryPolicy;
use crate::testing::ScriptedExecutor;
use chrono::Utc;
use std::time::Duration;

struct Harness {
    manager: Arc<OperationManager>,
    hub: Arc<ConnectionHub>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn harness(executors: Vec<(&str, Arc<ScriptedExecutor>)>, hub_config: HubConfig) -> Harness {
    let mut registry = ExecutorRegistry::new();
    for (step_type, executor) in executors {
        registry.register(step_type, executor);
    }
    let (bus, events) = EventBus::channel();
    let manager = Arc::new(OperationManager::with_config(
        registry,
        bus,
        ManagerConfig {
            retry: RetryPolicy::immediate(),
            ..ManagerConfig::default()
        },
    ));
    let (hub, commands) = ConnectionHub::new(hub_config);
    let shutdown = CancellationToken::new();

    let snapshots: Arc<dyn SnapshotSource> = manager.clone();
    let broadcaster = StatusBroadcaster::new(Arc::clone(&hub), snapshots);
    tokio::spawn(broadcaster.run(events, commands, shutdown.clone()));

    Harness {
        manager,
        hub,
        shutdown,
    }
}

async fn next(connection: &Connection) -> WebSocketMessage {
    tokio::time::timeout(Duration::from_secs(5), connection.next_message())
        .await
        .expect("no message in time")
        .expect("connection closed")
}

/// Read messages on `channel` until a terminal one arrives.
async fn until_terminal(connection: &Connection, channel: &str) -> Vec<WebSocketMessage> {
    let mut received = Vec::new();
    loop {
        let message = next(connection).await;
        if message.channel != channel {
            continue;
        }
        let done = message.message_type.is_terminal();
        received.push(message);
        if done {
            return received;
        }
    }
}

async fn subscribe(harness: &Harness, connection: &Connection, channel: &str) {
    harness.hub.handle_client_text(
        connection,
        &json!({ "type": "subscribe", "id": "req-1", "channel": channel }).to_string(),
    );
    let ack = next(connection).await;
    assert_eq!(ack.message_type, MessageType::Ack);
    assert_eq!(ack.data["request_id"], "req-1");
}

fn three_steps() -> OperationRequest {
    OperationRequest::new("daily")
        .with_step(StepSpec::new("scrape", "scraping"))
        .with_step(StepSpec::new("process", "processing"))
        .with_step(StepSpec::new("index", "indexing"))
}

fn assert_gap_free(messages: &[WebSocketMessage], first: u64) {
    for (offset, message) in messages.iter().enumerate() {
        assert_eq!(message.sequence, first + offset as u64, "gap at {:?}", message);
    }
}

#[test]
fn test_progress_maps_to_both_channels() {
    let id = Uuid::new_v4();
    let event = OperationEvent {
        operation_id: id,
        operation_type: "processing".to_string(),
        symbols: Vec::new(),
        trace_id: "t".to_string(),
        version: 7,
        timestamp: Utc::now(),
        kind: EventKind::StepProgress {
            step: "process".to_string(),
            percent: 40,
            message: Some("sheet 2/5".to_string()),
            operation_progress: 20,
        },
    };

    let [op_frame, global_frame] = frames_for(&event);
    assert_eq!(op_frame.channel, format!("operation:{}", id));
    assert_eq!(op_frame.message_type, MessageType::StepProgress);
    assert_eq!(op_frame.data["progress"], 40);
    assert_eq!(op_frame.data["version"], 7);
    assert_eq!(global_frame.channel, "operations");
    assert_eq!(global_frame.message_type, MessageType::OperationProgress);
    assert_eq!(global_frame.data["progress"], 20);
}

#[test]
fn test_retry_maps_to_progress_with_status() {
    let event = OperationEvent {
        operation_id: Uuid::new_v4(),
        operation_type: "scraping".to_string(),
        symbols: Vec::new(),
        trace_id: "t".to_string(),
        version: 3,
        timestamp: Utc::now(),
        kind: EventKind::StepRetrying {
            step: "scrape".to_string(),
            attempt: 1,
            max_retries: 3,
            error: "connection reset".to_string(),
            delay_ms: 500,
            operation_progress: 0,
        },
    };
    let [op_frame, _] = frames_for(&event);
    assert_eq!(op_frame.message_type, MessageType::StepProgress);
    assert_eq!(op_frame.data["status"], "retrying");
    assert_eq!(op_frame.data["attempt"], 1);
}

#[tokio::test]
async fn test_snapshot_then_delta_without_gaps() {
    let ok = Arc::new(
        ScriptedExecutor::succeeding()
            .with_progress(&[50])
            .with_delay(Duration::from_millis(100)),
    );
    let harness = harness(
        vec![
            ("scraping", ok.clone()),
            ("processing", ok.clone()),
            ("indexing", ok.clone()),
        ],
        HubConfig::default(),
    );
    let connection = harness.hub.connect().await;
    assert_eq!(next(&connection).await.message_type, MessageType::Connect);

    let id = harness.manager.start(three_steps()).await.unwrap();
    let channel = format!("operation:{}", id);
    subscribe(&harness, &connection, &channel).await;

    let messages = until_terminal(&connection, &channel).await;
    let snapshot = &messages[0];
    assert_eq!(snapshot.message_type, MessageType::Snapshot);
    assert_eq!(snapshot.sequence, 1);
    assert_gap_free(&messages, 1);

    let baseline = snapshot.data["version"].as_u64().unwrap();
    let deltas = &messages[1..];
    assert!(deltas
        .iter()
        .all(|m| m.data["version"].as_u64().unwrap() > baseline));
    assert!(deltas
        .windows(2)
        .all(|w| w[0].data["version"].as_u64() < w[1].data["version"].as_u64()));

    let last = messages.last().unwrap();
    assert_eq!(last.message_type, MessageType::OperationComplete);
    let final_state = harness.manager.get_status(id).await.unwrap();
    assert_eq!(last.data["version"].as_u64().unwrap(), final_state.version);
}

#[tokio::test]
async fn test_late_subscriber_snapshot_matches_status() {
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let harness = harness(vec![("scraping", ok)], HubConfig::default());

    let id = harness
        .manager
        .start(OperationRequest::new("scraping").with_step(StepSpec::new("scrape", "scraping")))
        .await
        .unwrap();
    let finished = harness.manager.wait(id).await.unwrap();

    let connection = harness.hub.connect().await;
    next(&connection).await;
    subscribe(&harness, &connection, &format!("operation:{}", id)).await;

    let snapshot = next(&connection).await;
    assert_eq!(snapshot.message_type, MessageType::Snapshot);
    assert_eq!(snapshot.trace_id.as_deref(), Some(finished.trace_id.as_str()));
    assert_eq!(snapshot.data, serde_json::to_value(&finished).unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(connection.try_next_message().is_none());
}

#[tokio::test]
async fn test_concurrent_subscribers_each_gap_free() {
    let ok = Arc::new(ScriptedExecutor::succeeding().with_progress(&[10, 60]));
    let harness = harness(
        vec![
            ("scraping", ok.clone()),
            ("processing", ok.clone()),
            ("indexing", ok.clone()),
        ],
        HubConfig::default(),
    );

    let first = harness.hub.connect().await;
    let second = harness.hub.connect().await;
    for connection in [&first, &second] {
        next(connection).await;
        subscribe(&harness, connection, OPERATIONS_CHANNEL).await;
        assert_eq!(next(connection).await.message_type, MessageType::Snapshot);
    }

    harness.manager.start(three_steps()).await.unwrap();

    let a = until_terminal(&first, OPERATIONS_CHANNEL).await;
    let b = until_terminal(&second, OPERATIONS_CHANNEL).await;
    assert_gap_free(&a, 2);
    assert_gap_free(&b, 2);
    let types = |messages: &[WebSocketMessage]| {
        messages
            .iter()
            .map(|m| m.message_type)
            .collect::<Vec<_>>()
    };
    assert_eq!(types(&a), types(&b));
    assert_eq!(a[0].message_type, MessageType::OperationStart);
}

#[tokio::test]
async fn test_slow_consumer_keeps_terminal_messages() {
    let percents: Vec<u8> = (1..=60).collect();
    let chatty = Arc::new(ScriptedExecutor::succeeding().with_progress(&percents));
    let harness = harness(
        vec![("processing", chatty)],
        HubConfig {
            queue_capacity: 8,
            ..HubConfig::default()
        },
    );

    let connection = harness.hub.connect().await;
    next(&connection).await;
    subscribe(&harness, &connection, OPERATIONS_CHANNEL).await;
    assert_eq!(next(&connection).await.message_type, MessageType::Snapshot);

    let id = harness
        .manager
        .start(OperationRequest::new("processing").with_step(StepSpec::new("process", "processing")))
        .await
        .unwrap();
    // Never drain while the operation runs
    harness.manager.wait(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut queued = Vec::new();
    while let Some(message) = connection.try_next_message() {
        queued.push(message);
    }

    assert!(connection.dropped() > 0);
    assert!(connection.disconnect_reason().is_none());
    let types: Vec<MessageType> = queued.iter().map(|m| m.message_type).collect();
    assert_eq!(types.first(), Some(&MessageType::OperationStart));
    assert_eq!(types.last(), Some(&MessageType::OperationComplete));
    assert!(types.contains(&MessageType::StepStart));
    assert!(types.contains(&MessageType::StepComplete));
    // Drops show up as gaps, order is preserved
    assert!(queued.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test]
async fn test_overflow_of_critical_message_disconnects() {
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let harness = harness(
        vec![("scraping", ok)],
        HubConfig {
            queue_capacity: 2,
            ..HubConfig::default()
        },
    );

    // connect + ack fill the queue; the snapshot cannot be dropped
    let connection = harness.hub.connect().await;
    harness.hub.handle_client_text(
        &connection,
        r#"{"type":"subscribe","channel":"operations"}"#,
    );

    tokio::time::timeout(Duration::from_secs(5), connection.disconnected().cancelled())
        .await
        .expect("connection was not dropped");
    assert_eq!(
        connection.disconnect_reason(),
        Some(DisconnectReason::Overflow)
    );
    assert!(harness.hub.is_empty().await);
}

#[tokio::test]
async fn test_filter_on_global_channel() {
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let harness = harness(
        vec![("scraping", ok.clone()), ("indexing", ok.clone())],
        HubConfig::default(),
    );

    let connection = harness.hub.connect().await;
    next(&connection).await;
    harness.hub.handle_client_text(
        &connection,
        r#"{"type":"subscribe","channel":"operations","filter":{"type":"indexing"}}"#,
    );
    assert_eq!(next(&connection).await.message_type, MessageType::Ack);
    assert_eq!(next(&connection).await.message_type, MessageType::Snapshot);

    let scraping = harness
        .manager
        .start(OperationRequest::new("scraping").with_step(StepSpec::new("scrape", "scraping")))
        .await
        .unwrap();
    harness.manager.wait(scraping).await.unwrap();
    let indexing = harness
        .manager
        .start(OperationRequest::new("indexing").with_step(StepSpec::new("index", "indexing")))
        .await
        .unwrap();

    let messages = until_terminal(&connection, OPERATIONS_CHANNEL).await;
    assert!(messages
        .iter()
        .all(|m| m.data["operation_id"] == json!(indexing)));
    assert_gap_free(&messages, 2);
}

#[tokio::test]
async fn test_subscribe_errors_and_unsubscribe() {
    let harness = harness(Vec::new(), HubConfig::default());
    let connection = harness.hub.connect().await;
    next(&connection).await;

    harness.hub.handle_client_text(
        &connection,
        &json!({ "type": "subscribe", "id": "a", "channel": format!("operation:{}", Uuid::new_v4()) })
            .to_string(),
    );
    let error = next(&connection).await;
    assert_eq!(error.message_type, MessageType::Error);
    assert_eq!(error.data["code"], "NOT_FOUND");
    assert_eq!(error.data["request_id"], "a");

    harness.hub.handle_client_text(
        &connection,
        r#"{"type":"unsubscribe","id":"b","channel":"operations"}"#,
    );
    assert_eq!(next(&connection).await.data["code"], "NOT_SUBSCRIBED");

    subscribe(&harness, &connection, OPERATIONS_CHANNEL).await;
    next(&connection).await;
    harness.hub.handle_client_text(
        &connection,
        r#"{"type":"unsubscribe","id":"c","channel":"operations"}"#,
    );
    let ack = next(&connection).await;
    assert_eq!(ack.message_type, MessageType::Ack);
    assert_eq!(ack.data["action"], "unsubscribe");
    assert!(connection.channels().is_empty());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let (bus, events) = EventBus::channel();
    let (hub, commands) = ConnectionHub::new(HubConfig::default());
    let manager = Arc::new(OperationManager::new(ExecutorRegistry::new(), bus));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(StatusBroadcaster::new(hub, manager).run(events, commands, shutdown.clone()));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("broadcaster did not stop")
        .unwrap();
}
