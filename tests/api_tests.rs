//! API integration tests.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use serde_json::{json, Value};
use tower::ServiceExt;

mod common;
use common::{create_session, login, test_app, test_app_with_engine, StubEngine};

/// Health endpoint works without authentication.
#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Login with valid credentials issues a token cookie.
#[tokio::test]
async fn test_login_success() {
    let app = test_app().await;
    let cookie = login(&app, "alice", "alicepassword").await;
    assert!(cookie.starts_with("trmnl_session="));
    // token is opaque and long
    assert!(cookie.len() > "trmnl_session=".len() + 40);
}

/// Login with a wrong password is a generic 401.
#[tokio::test]
async fn test_login_invalid_credentials() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/login")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=alice&password=wrong"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Protected API endpoints reject missing tokens with 401.
#[tokio::test]
async fn test_sessions_require_auth() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/session/new")
                .method(Method::POST)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Browsers without a token are redirected to the login form.
#[tokio::test]
async fn test_html_redirects_to_login() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/")
                .method(Method::GET)
                .header(header::ACCEPT, "text/html,application/xhtml+xml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    assert!(location.starts_with("/login"));
}

/// Create a session, check its status, verify it shows up for its owner.
#[tokio::test]
async fn test_create_and_status() {
    let app = test_app().await;
    let cookie = login(&app, "alice", "alicepassword").await;

    let id = create_session(&app, &cookie).await;
    assert_eq!(id.len(), 32);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/session/{}/status", id))
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["state"], "running");
    assert!(json["created_at"].is_string());

    // owner sees it in their listing
    let response = app
        .oneshot(
            Request::builder()
                .uri("/my/sessions")
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["sessions"].as_array().unwrap().len(), 1);
    assert_eq!(json["sessions"][0]["id"], id.as_str());
}

/// Another authenticated user must not see or touch the session.
#[tokio::test]
async fn test_ownership_enforced() {
    let app = test_app().await;
    let alice = login(&app, "alice", "alicepassword").await;
    let bob = login(&app, "bob", "bobpassword").await;

    let id = create_session(&app, &alice).await;

    for uri in [
        format!("/session/{}/status", id),
        format!("/terminal/{}", id),
        format!("/session/{}/browse", id),
    ] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(&uri)
                    .method(Method::GET)
                    .header(header::COOKIE, &bob)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
    }

    // bob cannot delete alice's session either
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/session/{}", id))
                .method(Method::DELETE)
                .header(header::COOKIE, &bob)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

/// Delete tears the session down; a second delete is an idempotent 204.
#[tokio::test]
async fn test_delete_session() {
    let engine = Arc::new(StubEngine::default());
    let app = test_app_with_engine(engine.clone()).await;
    let cookie = login(&app, "alice", "alicepassword").await;
    let id = create_session(&app, &cookie).await;

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/session/{}", id))
                    .method(Method::DELETE)
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    // container removed exactly once
    assert_eq!(engine.removed.load(Ordering::SeqCst), 1);

    // status is now a 404
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/session/{}/status", id))
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// The per-user quota turns into a 429 without consuming resources.
#[tokio::test]
async fn test_quota_exceeded() {
    let app = test_app().await;
    let cookie = login(&app, "alice", "alicepassword").await;

    for _ in 0..common::MAX_SESSIONS_PER_USER {
        create_session(&app, &cookie).await;
    }

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/session/new")
                .method(Method::POST)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // other users are unaffected
    let bob = login(&app, "bob", "bobpassword").await;
    create_session(&app, &bob).await;
}

/// Batch status reports owned sessions and `gone` for everything else.
#[tokio::test]
async fn test_batch_status() {
    let app = test_app().await;
    let alice = login(&app, "alice", "alicepassword").await;
    let bob = login(&app, "bob", "bobpassword").await;

    let mine = create_session(&app, &alice).await;
    let theirs = create_session(&app, &bob).await;

    let body = json!({
        "session_ids": [mine, "NONEXISTENT", theirs]
    });
    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/status")
                .method(Method::POST)
                .header(header::COOKIE, &alice)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["sessions"][&mine]["status"], "running");
    assert!(json["sessions"][&mine]["created_at"].is_string());
    assert_eq!(json["sessions"]["NONEXISTENT"]["status"], "gone");
    // bob's session is indistinguishable from a nonexistent one
    assert_eq!(json["sessions"][&theirs]["status"], "gone");
}

/// Logout revokes the token.
#[tokio::test]
async fn test_logout_revokes_token() {
    let app = test_app().await;
    let cookie = login(&app, "alice", "alicepassword").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/logout")
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/session/new")
                .method(Method::POST)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// The container start failing surfaces as a retriable 503 and leaves no
/// ownership record behind.
#[tokio::test]
async fn test_container_start_failure() {
    let engine = Arc::new(StubEngine::default());
    let app = test_app_with_engine(engine.clone()).await;
    let cookie = login(&app, "alice", "alicepassword").await;

    engine.fail_create.store(true, Ordering::SeqCst);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/session/new")
                .method(Method::POST)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // compensated: a later create succeeds with the full pool
    engine.fail_create.store(false, Ordering::SeqCst);
    create_session(&app, &cookie).await;
}

/// The owner gets the terminal page; the bridge endpoint refuses an
/// upgrade without the daemon's subprotocol.
#[tokio::test]
async fn test_terminal_page_and_ws_subprotocol() {
    let app = test_app().await;
    let cookie = login(&app, "alice", "alicepassword").await;
    let id = create_session(&app, &cookie).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/terminal/{}", id))
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // WebSocket upgrade without the tty subprotocol fails before upgrading
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/terminal/{}/ws", id))
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .header(header::CONNECTION, "upgrade")
                .header(header::UPGRADE, "websocket")
                .header(header::SEC_WEBSOCKET_VERSION, "13")
                .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Upload, browse, and download confined to the workspace.
#[tokio::test]
async fn test_workspace_files_round_trip() {
    let app = test_app().await;
    let cookie = login(&app, "alice", "alicepassword").await;
    let id = create_session(&app, &cookie).await;

    let boundary = "testboundary123";
    let multipart_body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\nnotes/hello.txt\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
         Content-Type: text/plain\r\n\r\nhello workspace\r\n--{b}--\r\n",
        b = boundary
    );

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/session/{}/upload", id))
                .method(Method::POST)
                .header(header::COOKIE, &cookie)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(multipart_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/session/{}/browse?path=notes", id))
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["files"][0]["name"], "hello.txt");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/session/{}/download?path=notes/hello.txt", id))
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    assert_eq!(&body[..], b"hello workspace");

    // traversal is refused
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/session/{}/download?path=../secrets", id))
                .method(Method::GET)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Admin listing: admins see counts without ids, others get 403.
#[tokio::test]
async fn test_admin_listing() {
    let app = test_app().await;
    let alice = login(&app, "alice", "alicepassword").await;
    let root = login(&app, "root", "rootpassword").await;

    create_session(&app, &alice).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .method(Method::GET)
                .header(header::COOKIE, &alice)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .method(Method::GET)
                .header(header::COOKIE, &root)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["count"], 1);
    assert!(json["sessions"][0].get("id").is_none());
}
