//! Authentication errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No session token on the request.
    #[error("missing session token")]
    MissingToken,

    /// The token is unknown or was revoked.
    #[error("invalid session token")]
    InvalidToken,

    /// The token expired.
    #[error("session expired")]
    TokenExpired,

    /// Username/password pair rejected. Deliberately generic.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// The directory service could not be reached; retriable.
    #[error("identity backend unavailable")]
    DirectoryUnavailable(String),

    /// Too many failed login attempts.
    #[error("too many failed attempts, try again in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Internal error.
    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "missing_token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid_token"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "token_expired"),
            AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
            AuthError::DirectoryUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "identity_unavailable")
            }
            AuthError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(AuthErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_is_generic_for_credentials() {
        let err = AuthError::InvalidCredentials;
        assert_eq!(err.to_string(), "invalid username or password");
    }
}
