//! Test utilities and common setup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use tower::ServiceExt;

use trmnl::api::{self, AppState};
use trmnl::auth::{AuthInner, AuthState, IdentityVerifier, LocalUser, LoginRateLimiter, TokenStore};
use trmnl::container::{
    ContainerEngine, ContainerSpec, DiscoveredContainer, EngineError, EngineResult,
};
use trmnl::session::{OwnershipStore, PortAllocator, RegistryConfig, SessionRegistry};

/// Sessions each user may run in tests.
pub const MAX_SESSIONS_PER_USER: usize = 2;

/// Container engine stub: no engine required, failures switchable per test.
#[derive(Default)]
pub struct StubEngine {
    pub fail_create: AtomicBool,
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
}

#[async_trait]
impl ContainerEngine for StubEngine {
    async fn create_and_start(&self, spec: &ContainerSpec) -> EngineResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::StartFailed {
                name: spec.name.clone(),
                message: "stub start failure".into(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("cid-{}", spec.name))
    }

    async fn remove(&self, _name_or_id: &str) -> EngineResult<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _name_or_id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn state_status(&self, _name_or_id: &str) -> EngineResult<Option<String>> {
        Ok(None)
    }

    async fn await_ready(&self, _port: u16, _deadline: Duration) -> EngineResult<()> {
        Ok(())
    }

    async fn discover_session_containers(&self) -> EngineResult<Vec<DiscoveredContainer>> {
        Ok(vec![])
    }
}

fn make_local_user(password: &str, admin: bool) -> LocalUser {
    LocalUser {
        password_hash: bcrypt::hash(password, 4).expect("hashing test password"),
        admin,
        created_at: None,
    }
}

/// Build a full application router backed by a stub engine and a temp data
/// directory. Users: alice / bob (regular), root (admin), all with
/// `<name>password` as password.
pub async fn test_app() -> Router {
    test_app_with_engine(Arc::new(StubEngine::default())).await
}

pub async fn test_app_with_engine(engine: Arc<StubEngine>) -> Router {
    let dir = tempfile::TempDir::new().expect("creating test dir");

    let mut users = HashMap::new();
    users.insert("alice".to_string(), make_local_user("alicepassword", false));
    users.insert("bob".to_string(), make_local_user("bobpassword", false));
    users.insert("root".to_string(), make_local_user("rootpassword", true));

    let admins = ["root".to_string()].into_iter().collect();
    let tokens = Arc::new(TokenStore::new(24));
    let auth = AuthState::enabled(AuthInner {
        verifier: IdentityVerifier::new(users, None),
        tokens,
        limiter: LoginRateLimiter::default(),
        admins,
        cookie_secure: false,
    });

    let owners = Arc::new(OwnershipStore::load(dir.path().join("session_owners.json")));
    let registry = Arc::new(SessionRegistry::new(
        PortAllocator::new(17000, 17004),
        owners.clone(),
        engine.clone(),
        RegistryConfig {
            max_sessions_per_user: MAX_SESSIONS_PER_USER,
            workspace_root: dir.path().join("workspaces"),
            ready_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    ));

    let state = AppState::new(
        registry,
        owners,
        engine as Arc<dyn ContainerEngine>,
        auth,
    );

    // keep the temp dir alive for the rest of the test process
    std::mem::forget(dir);

    api::create_router(state, 10)
}

/// Log in through the real login endpoint and return the session cookie.
pub async fn login(app: &Router, username: &str, password: &str) -> String {
    let body = format!(
        "username={}&password={}",
        urlencoding::encode(username),
        urlencoding::encode(password)
    );
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/login")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response.status(),
        StatusCode::SEE_OTHER,
        "login for {} should redirect",
        username
    );

    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|h| h.to_str().ok())
        .expect("login should set a cookie");
    cookie
        .split(';')
        .next()
        .expect("cookie pair")
        .trim()
        .to_string()
}

/// Create a session and return its id.
pub async fn create_session(app: &Router, cookie: &str) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/session/new")
                .method(Method::POST)
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    json["id"].as_str().expect("session id").to_string()
}
