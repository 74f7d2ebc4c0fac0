use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// A device or transport the call needs could not be reached.
    #[error("Service unavailable ({kind}): {message}")]
    Unavailable { kind: String, message: String },

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl AppError {
    fn kind(&self) -> &str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::Unavailable { kind, .. } => kind,
            AppError::ExternalService(_) => "external_service",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unavailable { message, .. } => (StatusCode::SERVICE_UNAVAILABLE, message),
            AppError::ExternalService(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        tracing::error!("Error: {}: {}", status, message);

        let body = Json(json!({
            "error": message,
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}
