use axum::{
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
};
use services::services::{
    cli_tools::CliToolError, supervisor::SupervisorError, terminal_tabs::TerminalTabError,
};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// The underlying service is not in state `running`; handlers never
    /// invent a fallback.
    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ResponseJson(ApiResponse::<()>::error(self.to_string()));
        (status, body).into_response()
    }
}

impl From<TerminalTabError> for ApiError {
    fn from(e: TerminalTabError) -> Self {
        match e {
            TerminalTabError::UnknownTool(_) | TerminalTabError::TabNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            TerminalTabError::TabNotCloseable => ApiError::BadRequest(e.to_string()),
            TerminalTabError::NoPortAvailable(_) => ApiError::ServiceUnavailable(e.to_string()),
            TerminalTabError::Supervisor(_) | TerminalTabError::Database(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<CliToolError> for ApiError {
    fn from(e: CliToolError) -> Self {
        match e {
            CliToolError::UnknownTool(_) => ApiError::NotFound(e.to_string()),
            CliToolError::CommandFailed(_) => ApiError::BadRequest(e.to_string()),
            CliToolError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::NotRegistered(_) => ApiError::NotFound(e.to_string()),
            SupervisorError::NoPort(_) => ApiError::ServiceUnavailable(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}
