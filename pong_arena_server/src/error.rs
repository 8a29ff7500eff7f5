use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use shared::ErrorCode;

/// Error taxonomy surfaced by the core. Command loops return these instead of
/// propagating; HTTP routes map them through `IntoResponse`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("only the pausing player may resume")]
    UnauthorizedResume,

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Validation(_) => ErrorCode::InvalidInput,
            CoreError::Unauthorized(_) => ErrorCode::Unauthorized,
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::InvalidState(_) => ErrorCode::InvalidState,
            CoreError::UnauthorizedResume => ErrorCode::UnauthorizedResume,
            CoreError::RateLimit => ErrorCode::RateLimit,
            CoreError::Internal(_) => ErrorCode::Internal,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidState(_) | CoreError::UnauthorizedResume => StatusCode::CONFLICT,
            CoreError::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorCode,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        if matches!(self, CoreError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
