use crate::services::coordinator::CoordinatorError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    /// The request outlived its deadline; whatever it started was rolled back.
    pub fn timed_out() -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "request timed out")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Client errors keep their message; server errors are logged and replaced by
/// a generic one.
impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        let status = status_of(&err);
        if status.is_server_error() {
            error!("request failed: {}", err);
            let message = match status {
                StatusCode::SERVICE_UNAVAILABLE => "storage temporarily unavailable",
                StatusCode::GATEWAY_TIMEOUT => "request timed out",
                _ => "internal error",
            };
            return AppError::new(status, message);
        }
        AppError::new(status, err.to_string())
    }
}

fn status_of(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::BucketNotFound(_) | CoordinatorError::FileNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        CoordinatorError::PermissionDenied => StatusCode::FORBIDDEN,
        CoordinatorError::BadRequest(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::Conflict(_) => StatusCode::CONFLICT,
        CoordinatorError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::PartialBlobOrphan { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        CoordinatorError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
    }
}
