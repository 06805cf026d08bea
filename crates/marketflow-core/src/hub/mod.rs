//! ConnectionHub - live client connections and their subscriptions.
//!
//! The hub is transport-agnostic: a WebSocket task registers a
//! [`Connection`], forwards incoming text frames to
//! [`ConnectionHub::handle_client_text`] and writes whatever
//! [`Connection::next_message`] yields. Subscription changes are forwarded
//! to the status broadcaster so they are serialized with event fan-out.

/// Bounded outbound queue.
pub mod queue;
/// Subscription filters.
pub mod subscription;

pub use queue::{OutboundQueue, PushOutcome, QueueOverflow};
pub use subscription::{MessageScope, SubscriptionFilter};

use crate::broadcaster::{Channel, MessageType, WebSocketMessage, PROTOCOL_VERSION, SYSTEM_CHANNEL};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use subscription::Subscription;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Per-connection outbound queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often the transport pings the client
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Max time without client traffic before disconnecting
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Max time spent flushing queued messages on graceful close
    #[serde(default = "default_close_drain_timeout_ms")]
    pub close_drain_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_close_drain_timeout_ms() -> u64 {
    2_000
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ping_interval_secs: default_ping_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            close_drain_timeout_ms: default_close_drain_timeout_ms(),
        }
    }
}

impl HubConfig {
    /// Ping period
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Heartbeat timeout
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Graceful close budget
    #[must_use]
    pub fn close_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.close_drain_timeout_ms)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A message that may not be dropped found the queue full
    Overflow,
    /// No client traffic within the heartbeat timeout
    HeartbeatTimeout,
    /// The client closed the socket
    ClientClosed,
    /// Server shutdown
    Shutdown,
}

impl DisconnectReason {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overflow => "outbound queue overflow",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::ClientClosed => "client closed",
            Self::Shutdown => "server shutdown",
        }
    }
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Start receiving a channel
    Subscribe {
        /// Request id echoed in the `ack`
        #[serde(default)]
        id: Option<String>,
        /// `operations` or `operation:<uuid>`
        channel: String,
        /// Optional narrowing
        #[serde(default)]
        filter: Option<SubscriptionFilter>,
    },
    /// Stop receiving a channel
    Unsubscribe {
        /// Request id echoed in the `ack`
        #[serde(default)]
        id: Option<String>,
        /// Channel name
        channel: String,
    },
    /// Application-level keep-alive
    Ping {
        /// Request id echoed in the `ack`
        #[serde(default)]
        id: Option<String>,
    },
}

/// Subscription changes, applied on the broadcaster task.
#[derive(Debug)]
pub enum HubCommand {
    /// Establish (or replace) a subscription
    Subscribe {
        /// Requesting connection
        connection_id: Uuid,
        /// Client request id
        request_id: Option<String>,
        /// Parsed channel
        channel: Channel,
        /// Filter
        filter: SubscriptionFilter,
    },
    /// Remove a subscription
    Unsubscribe {
        /// Requesting connection
        connection_id: Uuid,
        /// Client request id
        request_id: Option<String>,
        /// Channel name as sent
        channel: String,
    },
}

/// Receiving half of the hub's command channel, owned by the broadcaster.
pub type HubCommands = mpsc::UnboundedReceiver<HubCommand>;

/// One client connection.
pub struct Connection {
    id: Uuid,
    queue: OutboundQueue,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    control_sequence: AtomicU64,
    last_seen: Mutex<Instant>,
    closing: CancellationToken,
    disconnected: CancellationToken,
    reason: OnceLock<DisconnectReason>,
}

impl Connection {
    fn new(id: Uuid, queue_capacity: usize) -> Self {
        Self {
            id,
            queue: OutboundQueue::new(queue_capacity),
            subscriptions: Mutex::new(HashMap::new()),
            control_sequence: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
            closing: CancellationToken::new(),
            disconnected: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    /// Session id announced in the `connect` message.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next message to write; `None` once closed and drained.
    pub async fn next_message(&self) -> Option<WebSocketMessage> {
        self.queue.pop().await
    }

    /// Next message without waiting.
    pub fn try_next_message(&self) -> Option<WebSocketMessage> {
        self.queue.try_pop()
    }

    /// Messages waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Progress messages dropped under backpressure.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Record client traffic.
    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    /// Whether the client has been silent longer than `timeout`.
    #[must_use]
    pub fn heartbeat_expired(&self, timeout: Duration) -> bool {
        lock(&self.last_seen).elapsed() > timeout
    }

    /// Fires when a graceful close starts; queued messages are still
    /// delivered.
    #[must_use]
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Fires when the hub drops the connection without draining.
    #[must_use]
    pub fn disconnected(&self) -> &CancellationToken {
        &self.disconnected
    }

    /// Why the connection ended, once it has.
    #[must_use]
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.reason.get().copied()
    }

    /// Subscribed channel names, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Enqueue a message on the control channel.
    pub(crate) fn send_control(&self, message_type: MessageType, data: Value) {
        let sequence = self.control_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = WebSocketMessage::new(message_type, SYSTEM_CHANNEL, sequence, data);
        if self.queue.push(message).is_err() {
            self.terminate(DisconnectReason::Overflow);
        }
    }

    /// Enqueue an `error` control message.
    pub(crate) fn send_error(&self, request_id: Option<&str>, code: &str, message: &str) {
        self.send_control(
            MessageType::Error,
            json!({ "request_id": request_id, "code": code, "message": message }),
        );
    }

    /// Replace the subscription for a channel and return its first sequence
    /// number (used by the snapshot).
    pub(crate) fn subscribe(&self, mut subscription: Subscription) -> u64 {
        let sequence = subscription.advance();
        lock(&self.subscriptions).insert(subscription.channel.to_string(), subscription);
        sequence
    }

    pub(crate) fn unsubscribe(&self, channel: &str) -> bool {
        lock(&self.subscriptions).remove(channel).is_some()
    }

    pub(crate) fn push(&self, message: WebSocketMessage) -> Result<PushOutcome, QueueOverflow> {
        self.queue.push(message)
    }

    /// Run `f` against the subscription for `channel`, if any.
    pub(crate) fn with_subscription<R>(
        &self,
        channel: &str,
        f: impl FnOnce(&mut Subscription) -> R,
    ) -> Option<R> {
        lock(&self.subscriptions).get_mut(channel).map(f)
    }

    /// Drop immediately; queued messages are discarded.
    pub(crate) fn terminate(&self, reason: DisconnectReason) {
        let _ = self.reason.set(reason);
        let discarded = self.queue.discard();
        if discarded > 0 {
            debug!(conn_id = %self.id, discarded, "Queued messages discarded");
        }
        self.closing.cancel();
        self.disconnected.cancel();
    }

    /// Stop accepting messages; the writer drains what is queued.
    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.reason.set(reason);
        self.queue.close();
        self.closing.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registry of live connections
pub struct ConnectionHub {
    config: HubConfig,
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl ConnectionHub {
    /// Create a hub and the command stream its broadcaster consumes.
    #[must_use]
    pub fn new(config: HubConfig) -> (Arc<Self>, HubCommands) {
        let (commands, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            config,
            connections: RwLock::new(HashMap::new()),
            commands,
        });
        (hub, rx)
    }

    /// Hub settings.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Server capabilities announced in the handshake.
    #[must_use]
    pub fn capabilities(&self) -> Value {
        json!({
            "protocol_version": PROTOCOL_VERSION,
            "channels": ["operations", "operation:<id>"],
            "message_types": MessageType::ALL.iter().map(MessageType::as_str).collect::<Vec<_>>(),
            "queue_capacity": self.config.queue_capacity,
            "heartbeat": {
                "ping_interval_secs": self.config.ping_interval_secs,
                "timeout_secs": self.config.heartbeat_timeout_secs,
            },
        })
    }

    /// Register a connection and queue its `connect` handshake.
    pub async fn connect(&self) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(Uuid::new_v4(), self.config.queue_capacity));
        connection.send_control(
            MessageType::Connect,
            json!({
                "session_id": connection.id,
                "server_time": Utc::now(),
                "capabilities": self.capabilities(),
            }),
        );
        self.connections
            .write()
            .await
            .insert(connection.id, Arc::clone(&connection));
        info!(conn_id = %connection.id, "Client connected");
        connection
    }

    /// Forget a connection.
    pub async fn disconnect(&self, id: Uuid, reason: DisconnectReason) {
        if let Some(connection) = self.connections.write().await.remove(&id) {
            connection.terminate(reason);
            info!(
                conn_id = %id,
                reason = reason.as_str(),
                dropped = connection.dropped(),
                "Client disconnected"
            );
        }
    }

    /// Live connection by id.
    pub async fn connection(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// All live connections.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no client is connected.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Handle a text frame received from a client.
    pub fn handle_client_text(&self, connection: &Connection, text: &str) {
        connection.touch();
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn_id = %connection.id, error = %e, "Malformed client frame");
                connection.send_error(None, "INVALID_MESSAGE", &e.to_string());
                return;
            }
        };

        match frame {
            ClientFrame::Subscribe {
                id,
                channel,
                filter,
            } => {
                let parsed: Channel = match channel.parse() {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        connection.send_error(id.as_deref(), "INVALID_CHANNEL", &e.to_string());
                        return;
                    }
                };
                self.forward(
                    connection,
                    HubCommand::Subscribe {
                        connection_id: connection.id,
                        request_id: id,
                        channel: parsed,
                        filter: filter.unwrap_or_default(),
                    },
                );
            }
            ClientFrame::Unsubscribe { id, channel } => self.forward(
                connection,
                HubCommand::Unsubscribe {
                    connection_id: connection.id,
                    request_id: id,
                    channel,
                },
            ),
            ClientFrame::Ping { id } => {
                connection.send_control(MessageType::Ack, json!({ "request_id": id, "pong": true }));
            }
        }
    }

    fn forward(&self, connection: &Connection, command: HubCommand) {
        if self.commands.send(command).is_err() {
            warn!(conn_id = %connection.id, "Broadcaster unavailable");
            connection.send_error(None, "UNAVAILABLE", "status broadcaster is not running");
        }
    }

    /// Close every connection gracefully (queued messages are still written).
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.close(DisconnectReason::Shutdown);
        }
        info!(connections = connections.len(), "Connection hub shut down");
    }
}
