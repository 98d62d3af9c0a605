use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use foamrun_core::security::redact_paths;
use foamrun_core::CoreError;
use serde_json::json;
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
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
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

// Convert core errors into client-safe responses. Messages here are
// deliberately generic: validation failures never echo the offending
// path, and runtime errors are path-redacted.
impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidPath(_) => Self::bad_request("Access denied"),
            CoreError::UnsafeRoot(_) => {
                Self::bad_request("Cannot set case root to system directory")
            }
            CoreError::NotFound(_) => Self::not_found("Case directory not found"),
            CoreError::CommandRejected(message) => Self::bad_request(message),
            CoreError::RuntimeUnavailable(_) => Self::unavailable("Docker daemon not available"),
            CoreError::Docker(message) => Self::internal(redact_paths(&message)),
            CoreError::Io(_) => Self::internal("An I/O error occurred. Please check the logs."),
            CoreError::Database(_)
            | CoreError::Parse(_)
            | CoreError::Serialization(_) => Self::internal("An internal server error occurred."),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
