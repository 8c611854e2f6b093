//! HTTP handlers: login flow, session CRUD, status reporting.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Form, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, instrument};

use crate::auth::{CurrentUser, VerifyError, SESSION_COOKIE};
use crate::session::{container_name_for, BatchStatusEntry, BatchStatusRequest, SessionState};

use super::error::{ApiError, ApiResult};
use super::pages;
use super::state::AppState;

/// The one place session ownership is enforced. Every handler that targets
/// a specific session id goes through here before touching the registry.
pub(crate) fn verify_owner(
    state: &AppState,
    user: &CurrentUser,
    session_id: &str,
) -> ApiResult<()> {
    match state.owners.get(session_id) {
        None => Err(ApiError::not_found("session not found")),
        Some(owner) if owner != user.username => Err(ApiError::Forbidden),
        Some(_) => Ok(()),
    }
}

/// Client address for rate limiting, best effort: the TLS edge sets
/// X-Real-IP / X-Forwarded-For.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// A redirect target is safe when it stays on this origin: a relative path
/// that is not protocol-relative.
fn is_safe_redirect(url: &str) -> bool {
    url.starts_with('/') && !url.starts_with("//") && !url.contains("://")
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /
pub async fn index() -> impl IntoResponse {
    pages::index()
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(default)]
    pub next: Option<String>,
}

/// GET /login
pub async fn login_page(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Response {
    if !state.auth.is_enabled() {
        return Redirect::to("/").into_response();
    }
    let next = query.next.as_deref().unwrap_or("/");
    pages::login(None, next).into_response()
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub next: Option<String>,
}

/// POST /login
#[instrument(skip(state, form, headers), fields(username = %form.username))]
pub async fn login_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let Some(auth) = state.auth.inner().cloned() else {
        return Redirect::to("/").into_response();
    };

    let username = form.username.trim().to_string();
    let next = form
        .next
        .as_deref()
        .filter(|n| is_safe_redirect(n))
        .unwrap_or("/")
        .to_string();
    let ip = client_ip(&headers);

    if auth.limiter.is_blocked(&username, &ip) {
        let remaining = auth.limiter.lockout_remaining_secs(&username, &ip);
        let minutes = remaining.div_ceil(60);
        log::warn!("login blocked for user '{}' from {} (rate limited)", username, ip);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            pages::login(
                Some(&format!(
                    "Too many failed attempts. Try again in {} minute(s).",
                    minutes
                )),
                &next,
            ),
        )
            .into_response();
    }

    match auth.verifier.verify(&username, &form.password).await {
        Ok(username) => {
            auth.limiter.clear_on_success(&username, &ip);
            let token = auth.tokens.mint(&username);
            let cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}{}",
                SESSION_COOKIE,
                token,
                auth.tokens.ttl_secs(),
                if auth.cookie_secure { "; Secure" } else { "" }
            );
            let mut response = Redirect::to(&next).into_response();
            if let Ok(value) = cookie.parse() {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            response
        }
        Err(VerifyError::Unavailable(msg)) => {
            log::error!("identity backend unavailable during login: {}", msg);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                pages::login(Some("Sign-in service unavailable, try again shortly."), &next),
            )
                .into_response()
        }
        Err(VerifyError::InvalidCredentials) => {
            let remaining = auth.limiter.record_failure(&username, &ip);
            info!("failed login for user '{}' from {}", username, ip);
            let mut message = "Invalid username or password.".to_string();
            if remaining > 0 && remaining <= 2 {
                message.push_str(&format!(" {} attempt(s) remaining.", remaining));
            }
            (
                StatusCode::UNAUTHORIZED,
                pages::login(Some(&message), &next),
            )
                .into_response()
        }
    }
}

/// GET /logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(auth) = state.auth.inner() {
        let token = headers
            .get(header::COOKIE)
            .and_then(|h| h.to_str().ok())
            .and_then(|cookies| {
                cookies.split(';').map(str::trim).find_map(|pair| {
                    pair.strip_prefix(SESSION_COOKIE)
                        .and_then(|rest| rest.strip_prefix('='))
                })
            });
        if let Some(token) = token {
            auth.tokens.revoke(token);
        }
    }

    let mut response = Redirect::to("/login").into_response();
    let clear = format!("{}=; Path=/; HttpOnly; Max-Age=0", SESSION_COOKIE);
    if let Ok(value) = clear.parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub id: String,
    pub redirect: String,
}

/// POST /session/new
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<CreateSessionResponse>> {
    let id = state.registry.create(&user.username).await?;
    info!(session_id = %id, "created session");
    Ok(Json(CreateSessionResponse {
        redirect: format!("/terminal/{}", id),
        id,
    }))
}

/// DELETE /session/{id}
///
/// Idempotent: deleting a session that is already gone still returns 204.
#[instrument(skip(state, user))]
pub async fn delete_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    if let Some(owner) = state.owners.get(&session_id) {
        if owner != user.username {
            return Err(ApiError::Forbidden);
        }
    }

    match state.registry.delete(&session_id).await {
        Ok(outcome) => {
            info!(session_id = %session_id, ?outcome, "session delete requested");
        }
        Err(crate::session::RegistryError::NotFound) => {
            // already gone; make sure no ownership record lingers
            if let Err(e) = state.owners.remove(&session_id) {
                log::error!("failed to prune ownership record for {}: {}", session_id, e);
            }
        }
        Err(e) => return Err(e.into()),
    }

    Ok(StatusCode::NO_CONTENT)
}

/// GET /session/{id}/status
#[instrument(skip(state, user))]
pub async fn session_status(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    verify_owner(&state, &user, &session_id)?;

    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ApiError::not_found("session not found"))?;

    Ok(Json(json!({
        "session_id": session.id,
        "state": session.state.to_string(),
        "created_at": session.created_at,
        "last_accessed": session.last_accessed,
    })))
}

/// POST /sessions/status - batch status for the caller's sessions.
///
/// Ids the caller does not own are reported `gone`, indistinguishable from
/// ids that never existed.
pub async fn batch_status(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<BatchStatusRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut sessions: HashMap<String, BatchStatusEntry> = HashMap::new();

    for id in request.session_ids {
        let owned = state
            .owners
            .get(&id)
            .map(|owner| owner == user.username)
            .unwrap_or(false);

        let entry = match (owned, state.registry.get(&id)) {
            (true, Some(session)) => {
                let status = match session.state {
                    SessionState::Starting => "starting",
                    SessionState::Running => "running",
                    SessionState::Terminating => "gone",
                };
                BatchStatusEntry {
                    status: status.to_string(),
                    created_at: Some(session.created_at),
                }
            }
            _ => BatchStatusEntry {
                status: "gone".to_string(),
                created_at: None,
            },
        };
        sessions.insert(id, entry);
    }

    Ok(Json(json!({ "sessions": sessions })))
}

/// GET /my/sessions - the caller's sessions with live status.
pub async fn my_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<serde_json::Value>> {
    let live = state.registry.sessions_for(&user.username);
    let mut result = Vec::new();
    for session in &live {
        if session.state == SessionState::Terminating {
            continue;
        }
        result.push(json!({
            "id": session.id,
            "label": &session.id[..session.id.len().min(8)],
            "status": session.state.to_string(),
            "created_at": session.created_at,
        }));
    }

    let prune: Vec<String> = state
        .owners
        .list_by_user(&user.username)
        .into_iter()
        .filter(|id| !live.iter().any(|s| &s.id == id))
        .collect();

    // Ownership entries with no live session point at containers that died
    // underneath us; drop them so they stop counting against the quota.
    for id in prune {
        let container = container_name_for(&id);
        match state.engine.state_status(&container).await {
            Ok(None) => {
                if let Err(e) = state.owners.remove(&id) {
                    log::error!("failed to prune ownership record for {}: {}", id, e);
                } else {
                    info!(session_id = %id, "pruned ownership record for vanished session");
                }
            }
            Ok(Some(_)) | Err(_) => {}
        }
    }

    result.sort_by(|a, b| {
        let rank = |v: &serde_json::Value| match v["status"].as_str() {
            Some("running") => 0,
            _ => 1,
        };
        rank(a)
            .cmp(&rank(b))
            .then_with(|| b["created_at"].to_string().cmp(&a["created_at"].to_string()))
    });

    Ok(Json(json!({
        "sessions": result,
        "max_sessions": state.registry.config().max_sessions_per_user,
    })))
}

/// GET /sessions - admin-only overview. Session ids are withheld so the
/// listing cannot be used to hijack sessions.
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<serde_json::Value>> {
    if state.auth.is_enabled() && !state.auth.is_admin(&user.username) {
        return Err(ApiError::Forbidden);
    }

    let sessions: Vec<serde_json::Value> = state
        .registry
        .all_sessions()
        .into_iter()
        .map(|s| {
            json!({
                "state": s.state.to_string(),
                "created_at": s.created_at,
                "last_accessed": s.last_accessed,
            })
        })
        .collect();

    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

/// GET /terminal/{id} - the terminal shell page.
#[instrument(skip(state, user))]
pub async fn terminal_page(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    verify_owner(&state, &user, &session_id)?;

    if state.registry.get(&session_id).is_none() {
        return Err(ApiError::not_found("session not found"));
    }
    state.registry.touch(&session_id);

    Ok(pages::terminal(&session_id).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_redirect() {
        assert!(is_safe_redirect("/"));
        assert!(is_safe_redirect("/terminal/abc"));
        assert!(!is_safe_redirect("//evil.example.com"));
        assert!(!is_safe_redirect("https://evil.example.com"));
        assert!(!is_safe_redirect(""));
        assert!(!is_safe_redirect("relative/path"));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "203.0.113.7");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.0.0.9");

        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }
}
