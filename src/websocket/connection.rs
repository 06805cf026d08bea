//! Operation status stream handler
//!
//! Registers the socket with the [`ConnectionHub`], forwards client frames to
//! it and writes whatever the connection's outbound queue yields. The socket
//! task also enforces the heartbeat and bounds the drain on graceful close.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    Extension,
};
use futures_util::{SinkExt, StreamExt};
use marketflow_core::{Connection, ConnectionHub, DisconnectReason, WebSocketMessage};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type WsSink = futures_util::stream::SplitSink<WebSocket, Message>;

/// WebSocket upgrade handler
pub async fn operations_handler(
    ws: WebSocketUpgrade,
    Extension(hub): Extension<Arc<ConnectionHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<ConnectionHub>) {
    let connection = hub.connect().await;
    let conn_id = connection.id();
    info!(conn_id = %conn_id, "Operations WS connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let config = hub.config().clone();
    let heartbeat_timeout = config.heartbeat_timeout();
    let mut ping_interval = tokio::time::interval(config.ping_interval());
    let mut drain_deadline: Option<Instant> = None;

    let reason = loop {
        tokio::select! {
            // Client frame
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => hub.handle_client_text(&connection, &text),
                    Some(Ok(Message::Ping(data))) => {
                        connection.touch();
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break DisconnectReason::ClientClosed;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => connection.touch(),
                    Some(Ok(Message::Close(_))) | None => break DisconnectReason::ClientClosed,
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "Operations WS error");
                        break DisconnectReason::ClientClosed;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        connection.touch();
                        debug!(conn_id = %conn_id, "Ignoring binary frame");
                    }
                }
            }
            // Outbound queue → client
            outbound = connection.next_message() => {
                match outbound {
                    Some(message) => {
                        if send_message(&mut ws_tx, &connection, &message).await.is_err() {
                            break DisconnectReason::ClientClosed;
                        }
                    }
                    // Closed by the hub and fully drained
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break connection
                            .disconnect_reason()
                            .unwrap_or(DisconnectReason::Shutdown);
                    }
                }
            }
            // Graceful close started: bound the drain
            _ = connection.closing().cancelled(), if drain_deadline.is_none() => {
                drain_deadline = Some(Instant::now() + config.close_drain_timeout());
            }
            _ = async move {
                match drain_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                warn!(
                    conn_id = %conn_id,
                    pending = connection.queued(),
                    "Close drain timed out"
                );
                let _ = ws_tx.send(Message::Close(None)).await;
                break connection
                    .disconnect_reason()
                    .unwrap_or(DisconnectReason::Shutdown);
            }
            // Server ping (WS protocol level)
            _ = ping_interval.tick() => {
                if connection.heartbeat_expired(heartbeat_timeout) {
                    info!(conn_id = %conn_id, "Heartbeat timeout, closing");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break DisconnectReason::HeartbeatTimeout;
                }
                if ws_tx.send(Message::Ping(vec![])).await.is_err() {
                    break DisconnectReason::ClientClosed;
                }
            }
            // Dropped by the hub (outbound overflow)
            _ = connection.disconnected().cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break connection
                    .disconnect_reason()
                    .unwrap_or(DisconnectReason::Overflow);
            }
        }
    };

    hub.disconnect(conn_id, reason).await;
    info!(
        conn_id = %conn_id,
        reason = reason.as_str(),
        dropped = connection.dropped(),
        "Operations WS connection closed"
    );
}

async fn send_message(
    ws_tx: &mut WsSink,
    connection: &Connection,
    message: &WebSocketMessage,
) -> Result<(), axum::Error> {
    match message.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json)).await,
        Err(e) => {
            warn!(
                conn_id = %connection.id(),
                message_type = %message.message_type,
                error = %e,
                "Failed to serialize message"
            );
            Ok(())
        }
    }
}
