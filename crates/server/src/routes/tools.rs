//! External AI tool endpoints: detection, install, update, launch.

use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use services::services::cli_tools::ToolStatus;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

/// GET /api/tools
///
/// Detect every registry tool locally (no network).
pub async fn list_tools(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<ToolStatus>>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(
        state.tools.detect_all().await,
    )))
}

/// GET /api/tools/{id}
pub async fn detect_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ResponseJson<ApiResponse<ToolStatus>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(
        state.tools.detect(&id).await?,
    )))
}

/// POST /api/tools/{id}/install
pub async fn install_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ResponseJson<ApiResponse<ToolStatus>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(
        state.tools.install(&id).await?,
    )))
}

/// POST /api/tools/{id}/update
pub async fn update_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ResponseJson<ApiResponse<ToolStatus>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(
        state.tools.update(&id).await?,
    )))
}

#[derive(Debug, Deserialize)]
pub struct LaunchToolRequest {
    pub project_path: String,
}

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct LaunchToolResponse {
    pub tab_id: String,
    pub url: Option<String>,
}

/// POST /api/tools/{id}/launch
///
/// Launch the tool into a project folder, with resume detection from
/// the launch history.
pub async fn launch_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ResponseJson(request): ResponseJson<LaunchToolRequest>,
) -> Result<ResponseJson<ApiResponse<LaunchToolResponse>>, ApiError> {
    let project = std::path::Path::new(&request.project_path);
    if !project.is_dir() {
        return Err(ApiError::BadRequest(format!(
            "Project path is not a directory: {}",
            request.project_path
        )));
    }

    let tab = state.terminals.open_tool(&id, project).await?;
    Ok(ResponseJson(ApiResponse::success(LaunchToolResponse {
        tab_id: tab.tab_id,
        url: tab.server_url,
    })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/{id}", get(detect_tool))
        .route("/tools/{id}/install", post(install_tool))
        .route("/tools/{id}/update", post(update_tool))
        .route("/tools/{id}/launch", post(launch_tool))
}
