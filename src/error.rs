//! Service-level error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::auth::AuthError;
use crate::db::DbError;
use crate::sync::protocol::close_codes;

/// Errors surfaced on synchronous request paths
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Missing, malformed or expired credential
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid identity without the required capability
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed payload or room
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    /// Store or key set unreachable
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// WebSocket close code used when the same failure ends a connection
    pub fn close_code(&self) -> u16 {
        match self {
            ServiceError::Unauthorized(_) => close_codes::UNAUTHORIZED,
            ServiceError::Forbidden(_) => close_codes::FORBIDDEN,
            ServiceError::BadRequest(_) => close_codes::INVALID_CONTEXT,
            ServiceError::NotFound(_) | ServiceError::MethodNotAllowed | ServiceError::Internal(_) => {
                close_codes::INTERNAL
            }
        }
    }

    /// Reason safe to show a client; internal details stay in the logs
    pub fn public_reason(&self) -> String {
        match self {
            ServiceError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredential | AuthError::InvalidToken(_) => {
                ServiceError::Unauthorized(err.to_string())
            }
            AuthError::InvalidRoom(_) | AuthError::InvalidContext(_) => ServiceError::BadRequest(err.to_string()),
            AuthError::Forbidden => ServiceError::Forbidden(err.to_string()),
            AuthError::KeySetUnavailable(_) | AuthError::Store(_) => ServiceError::Internal(err.to_string()),
        }
    }
}

impl From<DbError> for ServiceError {
    fn from(err: DbError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if let ServiceError::Internal(detail) = &self {
            error!("Request failed: {}", detail);
        }
        (self.status(), self.public_reason()).into_response()
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
