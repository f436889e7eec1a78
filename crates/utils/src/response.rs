use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Uniform envelope for every command/response exchanged with the UI.
///
/// The UI never receives a bare payload: success carries `data`, failure
/// carries a human-readable `error_data` message and `success: false`.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error_data: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_data: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let resp = ApiResponse::success(41u16);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"data\":41"));
    }

    #[test]
    fn test_error_envelope() {
        let resp: ApiResponse<u16> = ApiResponse::error("service not running");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("service not running"));
    }
}
