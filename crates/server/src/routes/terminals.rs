//! Terminal tab endpoints.

use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use services::services::terminal_tabs::TerminalTab;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreateTerminalKind {
    Generic,
    Tool,
}

#[derive(Debug, Deserialize)]
pub struct CreateTerminalRequest {
    pub kind: CreateTerminalKind,
    pub tool_id: Option<String>,
    pub cwd: String,
    pub command: Option<String>,
}

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct TerminalListResponse {
    pub tabs: Vec<TerminalTab>,
    pub active: Option<String>,
}

/// POST /api/terminals
pub async fn create_terminal(
    State(state): State<AppState>,
    ResponseJson(request): ResponseJson<CreateTerminalRequest>,
) -> Result<ResponseJson<ApiResponse<TerminalTab>>, ApiError> {
    let cwd = std::path::Path::new(&request.cwd);
    if !cwd.is_dir() {
        return Err(ApiError::BadRequest(format!(
            "Working directory does not exist: {}",
            request.cwd
        )));
    }

    let tab = match request.kind {
        CreateTerminalKind::Generic => state.terminals.open_generic(cwd, request.command).await?,
        CreateTerminalKind::Tool => {
            let tool_id = request.tool_id.ok_or_else(|| {
                ApiError::BadRequest("tool_id is required for tool terminals".to_string())
            })?;
            state.terminals.open_tool(&tool_id, cwd).await?
        }
    };
    Ok(ResponseJson(ApiResponse::success(tab)))
}

/// GET /api/terminals
///
/// Ordered tab list plus the active tab, enough state for the UI's tab
/// strip, overflow scrolling and keyboard navigation.
pub async fn list_terminals(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<TerminalListResponse>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(TerminalListResponse {
        tabs: state.terminals.list(),
        active: state.terminals.active(),
    })))
}

/// DELETE /api/terminals/{tab_id}
pub async fn kill_terminal(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.terminals.close(&tab_id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/terminals", post(create_terminal))
        .route("/terminals", get(list_terminals))
        .route("/terminals/{tab_id}", delete(kill_terminal))
}
