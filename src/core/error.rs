use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::notify::MailError;
use crate::queue::QueueError;
use crate::worker::similarity::ApiError;
use crate::worker::storage::ArtifactError;

/// Service-wide error type shared by the HTTP surface, the tool surface and
/// the background worker.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Rejected input (bad file extension, missing field, duplicate account)
    #[error("{0}")]
    Validation(String),
    /// Missing or invalid credentials
    #[error("{0}")]
    Unauthorized(String),
    /// Authenticated but not allowed
    #[error("{0}")]
    Forbidden(String),
    /// Unknown dataset, user, token or job
    #[error("{0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Storage error: {0}")]
    Storage(#[from] ArtifactError),
    #[error("External API error: {0}")]
    ExternalApi(#[from] ApiError),
    #[error("Mail error: {0}")]
    Mail(#[from] MailError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Stable machine-readable code included in error bodies
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::Forbidden(_) => "FORBIDDEN",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::Database(_) => "DATABASE_ERROR",
            ServiceError::Queue(_) => "QUEUE_ERROR",
            ServiceError::Storage(_) => "STORAGE_ERROR",
            ServiceError::ExternalApi(_) => "EXTERNAL_API_ERROR",
            ServiceError::Mail(_) => "MAIL_ERROR",
            ServiceError::Config(_) => "CONFIG_ERROR",
            ServiceError::Io(_) => "IO_ERROR",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation(_)
                | ServiceError::Unauthorized(_)
                | ServiceError::Forbidden(_)
                | ServiceError::NotFound(_)
        )
    }
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Hash(e) => ServiceError::Internal(format!("password hashing failed: {}", e)),
            _ => ServiceError::Unauthorized("Could not validate credentials".to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Internal(format!("JSON error: {}", err))
    }
}

/// Error body returned by every failing endpoint
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub detail: String,
    pub error_code: String,
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if !self.is_client_error() {
            log::error!("Request failed: {}", self);
        }

        let mut builder = HttpResponse::build(self.status_code());
        if matches!(self, ServiceError::Unauthorized(_)) {
            builder.insert_header((header::WWW_AUTHENTICATE, "Bearer"));
        }
        builder.json(ErrorResponse {
            success: false,
            detail: self.to_string(),
            error_code: self.error_code().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServiceError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ServiceError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ServiceError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unauthorized_carries_bearer_challenge() {
        let response = ServiceError::Unauthorized("no token".into()).error_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).and_then(|v| v.to_str().ok()),
            Some("Bearer")
        );
    }

    #[test]
    fn test_client_messages_are_verbatim() {
        let err = ServiceError::Validation("Invalid H5AD file format.".into());
        assert_eq!(err.to_string(), "Invalid H5AD file format.");
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
