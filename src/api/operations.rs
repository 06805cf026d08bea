//! Operations API endpoints
//!
//! POST   /api/v1/operations           - Start an operation
//! GET    /api/v1/operations           - List operations
//! GET    /api/v1/operations/:id       - Operation status
//! DELETE /api/v1/operations/:id       - Remove a finished operation
//! POST   /api/v1/operations/:id/stop  - Stop an operation

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use marketflow_core::{Error, OperationFilter, OperationManager, OperationRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::ApiResponse;

/// Response to a successful start
#[derive(Debug, Serialize)]
pub struct StartedResponse {
    pub operation_id: Uuid,
    pub status: &'static str,
    pub websocket_channel: String,
}

/// Stop options
#[derive(Debug, Default, Deserialize)]
pub struct StopQuery {
    #[serde(default)]
    pub force: bool,
}

/// HTTP status for an engine error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Execution { .. } | Error::Cancelled | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(error: Error) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!(error = %error, "Operation request failed");
    }
    (
        status,
        Json(ApiResponse::<()>::error(error.code(), error.to_string())),
    )
        .into_response()
}

/// Start an operation
pub async fn start_operation(
    Extension(manager): Extension<Arc<OperationManager>>,
    Json(request): Json<OperationRequest>,
) -> Response {
    match manager.start(request).await {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(StartedResponse {
                operation_id: id,
                status: "pending",
                websocket_channel: format!("operation:{}", id),
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// List operations, newest first
pub async fn list_operations(
    Extension(manager): Extension<Arc<OperationManager>>,
    Query(filter): Query<OperationFilter>,
) -> Response {
    Json(ApiResponse::success(manager.list(&filter).await)).into_response()
}

/// Get one operation
pub async fn get_operation(
    Extension(manager): Extension<Arc<OperationManager>>,
    Path(id): Path<Uuid>,
) -> Response {
    match manager.get_status(id).await {
        Ok(op) => Json(ApiResponse::success(op)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Stop an operation (`?force=true` for an immediate stop)
pub async fn stop_operation(
    Extension(manager): Extension<Arc<OperationManager>>,
    Path(id): Path<Uuid>,
    Query(query): Query<StopQuery>,
) -> Response {
    match manager.stop(id, query.force).await {
        Ok(op) => Json(ApiResponse::success(op)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Delete a finished operation
pub async fn delete_operation(
    Extension(manager): Extension<Arc<OperationManager>>,
    Path(id): Path<Uuid>,
) -> Response {
    match manager.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// Create operations routes
pub fn operations_routes() -> Router {
    Router::new()
        .route(
            "/api/v1/operations",
            get(list_operations).post(start_operation),
        )
        .route(
            "/api/v1/operations/:id",
            get(get_operation).delete(delete_operation),
        )
        .route("/api/v1/operations/:id/stop", post(stop_operation))
}
