//! WebSocket module for MarketFlow
//!
//! - /ws/operations - operation status stream

pub mod connection;

pub use connection::operations_handler;

use axum::{routing::get, Router};

/// Create the WebSocket router
pub fn websocket_router() -> Router {
    Router::new().route("/ws/operations", get(operations_handler))
}
