//! API route definitions.

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::auth_middleware;
use crate::ws;

use super::files;
use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState, max_upload_size_mb: usize) -> Router {
    let max_body_size = max_upload_size_mb * 1024 * 1024;

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let auth_state = state.auth.clone();

    // Everything except the login flow sits behind the gate.
    let protected_routes = Router::new()
        .route("/", get(handlers::index))
        // Session lifecycle
        .route("/session/new", post(handlers::create_session))
        .route("/session/{session_id}", delete(handlers::delete_session))
        .route(
            "/session/{session_id}/status",
            get(handlers::session_status),
        )
        .route("/sessions/status", post(handlers::batch_status))
        .route("/my/sessions", get(handlers::my_sessions))
        .route("/sessions", get(handlers::list_sessions))
        // Terminal
        .route("/terminal/{session_id}", get(handlers::terminal_page))
        .route("/terminal/{session_id}/ws", get(ws::terminal_ws))
        .route("/terminal/{session_id}/connect", post(ws::terminal_connect))
        .route("/terminal/{session_id}/poll", get(ws::terminal_poll))
        .route("/terminal/{session_id}/input", post(ws::terminal_input))
        .route("/terminal/{session_id}/resize", post(ws::terminal_resize))
        .route(
            "/terminal/{session_id}/disconnect",
            post(ws::terminal_disconnect),
        )
        // Workspace files
        .route("/session/{session_id}/upload", post(files::upload_file))
        .route("/session/{session_id}/browse", get(files::browse_files))
        .route("/session/{session_id}/download", get(files::download_file))
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/login",
            get(handlers::login_page).post(handlers::login_submit),
        )
        .route("/logout", get(handlers::logout));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(trace_layer)
        .with_state(state)
}
