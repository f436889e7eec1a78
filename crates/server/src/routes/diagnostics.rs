//! Read-only view of the core's resource state.

use axum::{Router, extract::State, response::Json as ResponseJson, routing::get};
use serde::Serialize;
use services::services::{port_pool::PortPoolDiagnostics, supervisor::ProcessSnapshot};
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct DiagnosticsResponse {
    pub ports: PortPoolDiagnostics,
    pub processes: Vec<ProcessSnapshot>,
}

/// GET /api/diagnostics
pub async fn diagnostics(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<DiagnosticsResponse>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(DiagnosticsResponse {
        ports: state.supervisor.ports().diagnostics(),
        processes: state.supervisor.statuses(),
    })))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/diagnostics", get(diagnostics))
}
