//! Port lookup endpoints for the long-lived services.
//!
//! A port is only ever returned for a service in state `running`;
//! anything else is a "service unavailable" error the UI surfaces
//! directly. No handler invents a fallback port.

use axum::{
    Router,
    extract::State,
    response::Json as ResponseJson,
    routing::get,
};
use services::services::service_names;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

/// GET /api/services/memory/port
pub async fn memory_service_port(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<u16>>, ApiError> {
    state
        .supervisor
        .running_port(service_names::MEMORY_SERVICE)
        .map(|port| ResponseJson(ApiResponse::success(port)))
        .ok_or_else(|| ApiError::ServiceUnavailable("Memory service is not running".to_string()))
}

/// GET /api/services/backend/port
pub async fn backend_service_port(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<u16>>, ApiError> {
    state
        .supervisor
        .running_port(service_names::BACKEND)
        .map(|port| ResponseJson(ApiResponse::success(port)))
        .ok_or_else(|| ApiError::ServiceUnavailable("Backend service is not running".to_string()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/services/memory/port", get(memory_service_port))
        .route("/services/backend/port", get(backend_service_port))
}
