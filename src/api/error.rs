//! HTTP error taxonomy.
//!
//! Every layer's typed errors funnel into `ApiError` here; this is the
//! single place that decides status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::VerifyError;
use crate::session::RegistryError;

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// API-boundary errors, one variant per user-visible outcome.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 401.
    #[error("unauthorized")]
    Unauthorized,

    /// 403: authenticated but not the owner (or not admin).
    #[error("access denied")]
    Forbidden,

    /// 404.
    #[error("{0}")]
    NotFound(String),

    /// 400.
    #[error("{0}")]
    BadRequest(String),

    /// 409: the session refuses new references while shutting down.
    #[error("{0}")]
    Conflict(String),

    /// 429.
    #[error("{0}")]
    TooManyRequests(String),

    /// 503, retriable.
    #[error("{0}")]
    Unavailable(String),

    /// 410: the terminal transport behind this session has gone away.
    #[error("{0}")]
    Gone(String),

    /// 500.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::TooManyRequests(_) => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ApiError::Gone(_) => (StatusCode::GONE, "gone"),
            ApiError::Internal(e) => {
                log::error!("internal error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => ApiError::NotFound("session not found".to_string()),
            RegistryError::PendingDelete => ApiError::Conflict(err.to_string()),
            RegistryError::QuotaExceeded { .. } => ApiError::TooManyRequests(err.to_string()),
            RegistryError::PortsExhausted
            | RegistryError::ContainerStartFailed(_)
            | RegistryError::EngineUnreachable(_) => ApiError::Unavailable(err.to_string()),
            RegistryError::Workspace(_) | RegistryError::Store(_) => {
                ApiError::Internal(anyhow::Error::new(err))
            }
        }
    }
}

impl From<VerifyError> for ApiError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::InvalidCredentials => ApiError::Unauthorized,
            VerifyError::Unavailable(msg) => ApiError::Unavailable(msg),
        }
    }
}
