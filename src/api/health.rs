//! Health check endpoint

use axum::extract::Extension;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use marketflow_core::{ConnectionHub, OperationManager};
use serde::Serialize;
use std::sync::Arc;

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_operations: usize,
    pub connections: usize,
}

async fn health(
    Extension(manager): Extension<Arc<OperationManager>>,
    Extension(hub): Extension<Arc<ConnectionHub>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        active_operations: manager.active_count().await,
        connections: hub.len().await,
    })
}

/// Create health routes
pub fn health_routes() -> Router {
    Router::new().route("/health", get(health))
}
