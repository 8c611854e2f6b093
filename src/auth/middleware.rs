//! Request gate: resolves the session cookie into an authenticated user.
//!
//! Every protected route passes through `auth_middleware`, which turns the
//! token cookie into a `CurrentUser` extension or rejects the request.
//! Browsers get a redirect to the login page; API and WebSocket callers get
//! a bare 401.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::{header, request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};

use super::error::AuthError;
use super::ratelimit::LoginRateLimiter;
use super::tokens::{TokenError, TokenStore};
use super::users::IdentityVerifier;

/// Name of the session token cookie.
pub const SESSION_COOKIE: &str = "trmnl_session";

/// Username used for every request when authentication is disabled.
pub const ANONYMOUS_USER: &str = "__anonymous__";

/// Find a cookie value in a Cookie header.
fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Everything the login flow and the gate need, present only when an auth
/// file was configured.
pub struct AuthInner {
    pub verifier: IdentityVerifier,
    pub tokens: Arc<TokenStore>,
    pub limiter: LoginRateLimiter,
    /// Usernames carrying the admin flag, for the admin listing.
    pub admins: HashSet<String>,
    /// Whether the Secure attribute goes on the cookie.
    pub cookie_secure: bool,
}

/// Authentication state shared across handlers.
///
/// `None` inside means the server runs unauthenticated (loopback-only
/// mode): every request acts as the anonymous user.
#[derive(Clone)]
pub struct AuthState {
    inner: Option<Arc<AuthInner>>,
}

impl AuthState {
    /// Auth disabled: single anonymous user.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Auth enabled with the given verifier and token store.
    pub fn enabled(inner: AuthInner) -> Self {
        Self {
            inner: Some(Arc::new(inner)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn inner(&self) -> Option<&Arc<AuthInner>> {
        self.inner.as_ref()
    }

    /// Admin check. With auth disabled everyone is the anonymous admin.
    pub fn is_admin(&self, username: &str) -> bool {
        match &self.inner {
            Some(inner) => inner.admins.contains(username),
            None => true,
        }
    }
}

/// Authenticated user extracted from request extensions.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub username: String,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Decide how to refuse an unauthenticated request: WebSocket upgrades and
/// API callers get 401, browsers get sent to the login form with a return
/// path.
fn reject_unauthenticated(req: &axum::http::Request<axum::body::Body>) -> Response {
    let is_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let wants_html = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);

    if is_upgrade || !wants_html {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let next = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Redirect::to(&format!("/login?next={}", urlencoding::encode(next))).into_response()
}

/// The gate itself. Applied to every route that is not explicitly public.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(inner) = auth.inner() else {
        req.extensions_mut().insert(CurrentUser {
            username: ANONYMOUS_USER.to_string(),
        });
        return next.run(req).await;
    };

    let token = req
        .headers()
        .get(header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| token_from_cookie_header(cookies, SESSION_COOKIE));

    let Some(token) = token else {
        return reject_unauthenticated(&req);
    };

    match inner.tokens.resolve(token) {
        Ok(username) => {
            req.extensions_mut().insert(CurrentUser { username });
            next.run(req).await
        }
        Err(TokenError::Expired) | Err(TokenError::Unknown) => reject_unauthenticated(&req),
    }
}
