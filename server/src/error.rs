//! HTTP error surface.
//!
//! Expected failures map onto OpenAI-style error bodies
//! (`{"error":{"message","type","param","code"}}`) with 4xx statuses;
//! a 500 only ever means a genuinely unexpected fault.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use kolosal_engines::NodeError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub code: String,
    pub message: String,
    pub param: Option<String>,
}

/// Error body shape shared by every failure response.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<String>,
    pub code: String,
}

impl ApiError {
    pub fn validation(code: &str, message: impl Into<String>, param: Option<&str>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type: "invalid_request_error",
            code: code.to_string(),
            message: message.into(),
            param: param.map(str::to_string),
        }
    }

    pub fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error_type: "not_found_error",
            code: code.to_string(),
            message: message.into(),
            param: None,
        }
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error_type: "conflict_error",
            code: code.to_string(),
            message: message.into(),
            param: None,
        }
    }

    pub fn unprocessable(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            error_type: "model_error",
            code: code.to_string(),
            message: message.into(),
            param: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_type: "server_error",
            code: "internal_error".to_string(),
            message: message.into(),
            param: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.message,
                error_type: self.error_type.to_string(),
                param: self.param,
                code: self.code,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::AlreadyExists(id) => Self::conflict(
                "model_already_loaded",
                format!("Model '{id}' already exists on this server"),
            ),
            NodeError::NotFound(id) => {
                Self::not_found("model_not_found", format!("Model '{id}' not found"))
            }
            NodeError::Validation(msg) => {
                Self::validation("invalid_model_path", msg, Some("model_path"))
            }
            NodeError::BackendSelection(msg) => {
                Self::validation("invalid_inference_engine", msg, Some("inference_engine"))
            }
            NodeError::LoadFailed { engine_id, reason } => Self::unprocessable(
                "model_load_failed",
                format!(
                    "Failed to load model '{engine_id}': {reason}. \
                     Check available memory, GPU capacity, context size and model file integrity."
                ),
            ),
            NodeError::Backend(e) => {
                Self::unprocessable("inference_engine_error", e.to_string())
            }
            NodeError::Download(e) => {
                Self::validation("model_download_failed", e.to_string(), Some("model_path"))
            }
        }
    }
}
