use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use ws_orchestrator::OrchestratorError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    Unimplemented(String),
    Unavailable(String),
    Timeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unimplemented(msg) => (StatusCode::NOT_IMPLEMENTED, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(id) => {
                ApiError::NotFound(format!("Workspace not found: {}", id))
            }
            OrchestratorError::AlreadyExists(id) => {
                ApiError::Conflict(format!("Workspace already exists: {}", id))
            }
            OrchestratorError::PermissionDenied(msg) => ApiError::Forbidden(msg),
            OrchestratorError::InvalidInput(msg) => ApiError::BadRequest(msg),
            // Both an illegal requested transition and an exhausted CAS
            // retry budget surface as a conflict with current state.
            OrchestratorError::InvalidState(msg) | OrchestratorError::Conflict(msg) => {
                ApiError::Conflict(msg)
            }
            OrchestratorError::Unimplemented(msg) => ApiError::Unimplemented(msg),
            OrchestratorError::Unavailable(msg) => ApiError::Unavailable(msg),
            OrchestratorError::DeadlineExceeded(msg) => ApiError::Timeout(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
