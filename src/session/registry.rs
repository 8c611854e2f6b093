//! Session registry - owns the lifecycle of every live session.
//!
//! The registry is the only component that mutates session state. It holds
//! the session table and the port pool, enforces the per-user quota, and
//! implements the reference-count protocol that keeps a session's container
//! and port alive while bridges are attached to it.
//!
//! Locking discipline: one mutex over the session table, short critical
//! sections, never any I/O while the lock is held. Container engine calls,
//! readiness polls, and ownership-store writes all happen between lock
//! acquisitions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;

use crate::container::{ContainerEngine, ContainerSpec, EngineError, CONTAINER_NAME_PREFIX};

use super::models::{Session, SessionState};
use super::owners::{OwnershipStore, StoreError};
use super::ports::PortAllocator;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No such session.
    #[error("session not found")]
    NotFound,

    /// The session is being deleted and refuses new references.
    #[error("session is shutting down")]
    PendingDelete,

    /// The user already runs the maximum number of sessions.
    #[error("session limit reached ({limit} per user)")]
    QuotaExceeded { limit: usize },

    /// The port pool is empty.
    #[error("no free ports for a new session")]
    PortsExhausted,

    /// The container was created but never became usable.
    #[error("container failed to start: {0}")]
    ContainerStartFailed(String),

    /// The container engine itself is down; retriable.
    #[error("container engine unreachable: {0}")]
    EngineUnreachable(String),

    /// Workspace directory could not be prepared.
    #[error("workspace setup failed: {0}")]
    Workspace(String),

    /// Ownership store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Teardown ran to completion; the session is gone.
    Deleted,
    /// The session was marked; teardown runs when the last reference drops.
    Marked,
}

/// Registry tuning knobs, fixed at startup.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_sessions_per_user: usize,
    pub image: String,
    pub memory_bytes: u64,
    pub cpus: f64,
    pub ready_timeout: Duration,
    pub workspace_root: PathBuf,
    pub workspace_mount: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 3,
            image: "trmnl-session:latest".to_string(),
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpus: 0.0,
            ready_timeout: Duration::from_secs(30),
            workspace_root: PathBuf::from("data/workspaces"),
            workspace_mount: "/workspace".to_string(),
        }
    }
}

/// Mutable per-session record. Only touched under the registry lock.
#[derive(Debug)]
struct Slot {
    state: SessionState,
    port: u16,
    owner: String,
    container_name: String,
    container_id: String,
    workspace: PathBuf,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    ref_count: u32,
    pending_delete: bool,
    teardown_claimed: bool,
}

impl Slot {
    fn snapshot(&self, id: &str) -> Session {
        Session {
            id: id.to_string(),
            state: if self.pending_delete {
                SessionState::Terminating
            } else {
                self.state
            },
            port: self.port,
            owner: self.owner.clone(),
            container_name: self.container_name.clone(),
            container_id: self.container_id.clone(),
            workspace: self.workspace.clone(),
            created_at: self.created_at,
            last_accessed: self.last_accessed,
        }
    }
}

/// Everything teardown needs once a slot has been claimed.
struct TeardownTicket {
    id: String,
    port: u16,
    container_name: String,
    workspace: PathBuf,
}

/// Authoritative table of live sessions.
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    ports: PortAllocator,
    owners: Arc<OwnershipStore>,
    engine: Arc<dyn ContainerEngine>,
    config: RegistryConfig,
    create_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Generate an opaque 128-bit session id rendered as 32 hex chars.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Container name for a session id.
pub fn container_name_for(session_id: &str) -> String {
    let short = &session_id[..session_id.len().min(12)];
    format!("{}{}", CONTAINER_NAME_PREFIX, short)
}

impl SessionRegistry {
    pub fn new(
        ports: PortAllocator,
        owners: Arc<OwnershipStore>,
        engine: Arc<dyn ContainerEngine>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ports,
            owners,
            engine,
            config,
            create_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Create a session for `username`: quota check, port allocation,
    /// container start, readiness wait, ownership record, registry insert -
    /// in that order, compensating on any failure so nothing dangles.
    ///
    /// Creations for the same user are serialized so the quota check cannot
    /// be raced past.
    pub async fn create(self: &Arc<Self>, username: &str) -> Result<String, RegistryError> {
        let user_lock = {
            let mut locks = self.create_locks.lock().await;
            locks
                .entry(username.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _creating = user_lock.lock().await;

        let limit = self.config.max_sessions_per_user;
        {
            let slots = self.slots.lock().expect("session table lock poisoned");
            let live = slots
                .values()
                .filter(|s| s.owner == username && !s.pending_delete)
                .count();
            if live >= limit {
                return Err(RegistryError::QuotaExceeded { limit });
            }
        }

        let port = self.ports.allocate().ok_or(RegistryError::PortsExhausted)?;

        let id = new_session_id();
        let container_name = container_name_for(&id);
        let workspace = self.config.workspace_root.join(&id);

        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            self.ports.release(port);
            return Err(RegistryError::Workspace(format!(
                "{}: {}",
                workspace.display(),
                e
            )));
        }

        let spec = ContainerSpec {
            name: container_name.clone(),
            image: self.config.image.clone(),
            host_port: port,
            workspace: workspace.clone(),
            workspace_mount: self.config.workspace_mount.clone(),
            memory_bytes: self.config.memory_bytes,
            cpus: self.config.cpus,
            hostname: container_name.clone(),
            env: [("TERM".to_string(), "xterm-256color".to_string())]
                .into_iter()
                .collect(),
        };

        let container_id = match self.engine.create_and_start(&spec).await {
            Ok(cid) => cid,
            Err(e) => {
                self.ports.release(port);
                let _ = tokio::fs::remove_dir_all(&workspace).await;
                return Err(match e {
                    EngineError::Unreachable(msg) => RegistryError::EngineUnreachable(msg),
                    other => RegistryError::ContainerStartFailed(other.to_string()),
                });
            }
        };

        log::info!(
            "created container {} for session {} on port {}",
            container_name,
            &id[..12],
            port
        );

        if let Err(e) = self.engine.await_ready(port, self.config.ready_timeout).await {
            log::warn!(
                "terminal daemon for session {} never became ready: {}",
                &id[..12],
                e
            );
            if let Err(remove_err) = self.engine.remove(&container_name).await {
                log::error!(
                    "failed to remove unready container {}: {}",
                    container_name,
                    remove_err
                );
            }
            self.ports.release(port);
            let _ = tokio::fs::remove_dir_all(&workspace).await;
            return Err(RegistryError::ContainerStartFailed(e.to_string()));
        }

        if let Err(e) = self.owners.put(&id, username) {
            if let Err(remove_err) = self.engine.remove(&container_name).await {
                log::error!(
                    "failed to remove container {} after ownership write failure: {}",
                    container_name,
                    remove_err
                );
            }
            self.ports.release(port);
            let _ = tokio::fs::remove_dir_all(&workspace).await;
            return Err(e.into());
        }

        let now = Utc::now();
        let slot = Slot {
            state: SessionState::Running,
            port,
            owner: username.to_string(),
            container_name,
            container_id,
            workspace,
            created_at: now,
            last_accessed: now,
            ref_count: 0,
            pending_delete: false,
            teardown_claimed: false,
        };

        self.slots
            .lock()
            .expect("session table lock poisoned")
            .insert(id.clone(), slot);

        Ok(id)
    }

    /// Read-only snapshot of one session.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.slots
            .lock()
            .expect("session table lock poisoned")
            .get(id)
            .map(|slot| slot.snapshot(id))
    }

    /// Snapshots of all sessions owned by `username`.
    pub fn sessions_for(&self, username: &str) -> Vec<Session> {
        self.slots
            .lock()
            .expect("session table lock poisoned")
            .iter()
            .filter(|(_, slot)| slot.owner == username)
            .map(|(id, slot)| slot.snapshot(id))
            .collect()
    }

    /// Snapshots of every live session.
    pub fn all_sessions(&self) -> Vec<Session> {
        self.slots
            .lock()
            .expect("session table lock poisoned")
            .iter()
            .map(|(id, slot)| slot.snapshot(id))
            .collect()
    }

    /// Take a reference on a session. Fails once deletion has been
    /// requested, so a handle always protects a session whose port and
    /// container are still alive.
    pub fn acquire(self: &Arc<Self>, id: &str) -> Result<SessionHandle, RegistryError> {
        let mut slots = self.slots.lock().expect("session table lock poisoned");
        let slot = slots.get_mut(id).ok_or(RegistryError::NotFound)?;
        if slot.pending_delete {
            return Err(RegistryError::PendingDelete);
        }
        slot.ref_count += 1;
        slot.last_accessed = Utc::now();
        Ok(SessionHandle {
            registry: Arc::clone(self),
            id: id.to_string(),
            port: slot.port,
            released: false,
        })
    }

    /// Request deletion. Marks the session immediately and returns without
    /// waiting for attached bridges; the last released handle completes the
    /// teardown. With no references held, teardown runs before returning.
    pub async fn delete(self: &Arc<Self>, id: &str) -> Result<DeleteOutcome, RegistryError> {
        let ticket = {
            let mut slots = self.slots.lock().expect("session table lock poisoned");
            let slot = slots.get_mut(id).ok_or(RegistryError::NotFound)?;
            slot.pending_delete = true;
            if slot.ref_count == 0 && !slot.teardown_claimed {
                slot.teardown_claimed = true;
                Some(TeardownTicket {
                    id: id.to_string(),
                    port: slot.port,
                    container_name: slot.container_name.clone(),
                    workspace: slot.workspace.clone(),
                })
            } else {
                None
            }
        };

        match ticket {
            Some(ticket) => {
                self.teardown(ticket).await;
                Ok(DeleteOutcome::Deleted)
            }
            None => {
                log::info!("session {} marked for deletion, bridges still attached", id);
                Ok(DeleteOutcome::Marked)
            }
        }
    }

    /// Update the last-accessed stamp.
    pub fn touch(&self, id: &str) {
        if let Some(slot) = self
            .slots
            .lock()
            .expect("session table lock poisoned")
            .get_mut(id)
        {
            slot.last_accessed = Utc::now();
        }
    }

    /// Re-register a session discovered at startup. The ownership record
    /// must already exist; the port is claimed out of the pool.
    pub fn adopt(
        &self,
        id: &str,
        owner: &str,
        port: u16,
        container_name: &str,
        container_id: &str,
        state: SessionState,
        created_at: DateTime<Utc>,
    ) -> bool {
        if !self.ports.reserve(port) {
            log::error!(
                "cannot adopt session {}: port {} not available in the pool",
                id,
                port
            );
            return false;
        }

        let slot = Slot {
            state,
            port,
            owner: owner.to_string(),
            container_name: container_name.to_string(),
            container_id: container_id.to_string(),
            workspace: self.config.workspace_root.join(id),
            created_at,
            last_accessed: Utc::now(),
            ref_count: 0,
            pending_delete: false,
            teardown_claimed: false,
        };
        self.slots
            .lock()
            .expect("session table lock poisoned")
            .insert(id.to_string(), slot);
        true
    }

    /// Flip an adopted session to Running once its daemon answers.
    pub fn mark_running(&self, id: &str) {
        if let Some(slot) = self
            .slots
            .lock()
            .expect("session table lock poisoned")
            .get_mut(id)
        {
            if slot.state == SessionState::Starting {
                slot.state = SessionState::Running;
            }
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Ports currently free in the pool.
    pub fn ports_available(&self) -> usize {
        self.ports.available()
    }

    /// Drop one reference; runs teardown when the last reference leaves a
    /// marked session.
    async fn release_ref(self: Arc<Self>, id: String) {
        let ticket = {
            let mut slots = self.slots.lock().expect("session table lock poisoned");
            let Some(slot) = slots.get_mut(&id) else {
                log::error!("release for unknown session {}", id);
                return;
            };
            if slot.ref_count == 0 {
                log::error!("ref count underflow for session {}", id);
                return;
            }
            slot.ref_count -= 1;
            if slot.pending_delete && slot.ref_count == 0 && !slot.teardown_claimed {
                slot.teardown_claimed = true;
                Some(TeardownTicket {
                    id: id.clone(),
                    port: slot.port,
                    container_name: slot.container_name.clone(),
                    workspace: slot.workspace.clone(),
                })
            } else {
                None
            }
        };

        if let Some(ticket) = ticket {
            self.teardown(ticket).await;
        }
    }

    /// Reclaim everything a session held: container, port, ownership
    /// record, registry entry - in that order. Each step tolerates the
    /// resource already being gone; `teardown_claimed` guarantees a single
    /// runner, so the port is released exactly once.
    async fn teardown(&self, ticket: TeardownTicket) {
        if let Err(e) = self.engine.remove(&ticket.container_name).await {
            log::warn!(
                "failed to remove container {}: {}",
                ticket.container_name,
                e
            );
        }

        self.ports.release(ticket.port);

        if let Err(e) = self.owners.remove(&ticket.id) {
            log::error!("failed to remove ownership record for {}: {}", ticket.id, e);
        }

        if let Err(e) = tokio::fs::remove_dir_all(&ticket.workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "failed to remove workspace {}: {}",
                    ticket.workspace.display(),
                    e
                );
            }
        }

        self.slots
            .lock()
            .expect("session table lock poisoned")
            .remove(&ticket.id);

        log::info!("session {} torn down, port {} released", ticket.id, ticket.port);
    }
}

/// A live reference to a session.
///
/// While a handle exists the session cannot be torn down, so the port and
/// container behind it stay valid. `release` consumes the handle; a handle
/// that is dropped instead still gives its reference back, but loudly.
pub struct SessionHandle {
    registry: Arc<SessionRegistry>,
    id: String,
    port: u16,
    released: bool,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("released", &self.released)
            .finish()
    }
}

impl SessionHandle {
    /// Session id this handle refers to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host port of the session's terminal daemon.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Give the reference back. Consuming `self` makes a double release
    /// unrepresentable.
    pub async fn release(mut self) {
        self.released = true;
        let registry = Arc::clone(&self.registry);
        let id = self.id.clone();
        registry.release_ref(id).await;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!("session handle for {} dropped without release", self.id);
        let registry = Arc::clone(&self.registry);
        let id = self.id.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                registry.release_ref(id).await;
            });
        } else {
            log::error!("leaked session reference for {}: no runtime", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    use crate::container::{DiscoveredContainer, EngineResult};

    #[derive(Default)]
    struct StubEngine {
        fail_create: AtomicBool,
        fail_ready: AtomicBool,
        engine_down: AtomicBool,
        created: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl ContainerEngine for StubEngine {
        async fn create_and_start(&self, spec: &ContainerSpec) -> EngineResult<String> {
            if self.engine_down.load(Ordering::SeqCst) {
                return Err(EngineError::Unreachable("stub engine down".into()));
            }
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
            Ok(Some("running".into()))
        }

        async fn await_ready(&self, port: u16, _deadline: Duration) -> EngineResult<()> {
            if self.fail_ready.load(Ordering::SeqCst) {
                return Err(EngineError::NotReady {
                    port,
                    waited_secs: 0,
                });
            }
            Ok(())
        }

        async fn discover_session_containers(&self) -> EngineResult<Vec<DiscoveredContainer>> {
            Ok(vec![])
        }
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        engine: Arc<StubEngine>,
        owners: Arc<OwnershipStore>,
        _dir: TempDir,
    }

    fn harness(pool_size: u16, max_per_user: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let owners = Arc::new(OwnershipStore::load(dir.path().join("owners.json")));
        let engine = Arc::new(StubEngine::default());
        let config = RegistryConfig {
            max_sessions_per_user: max_per_user,
            workspace_root: dir.path().join("workspaces"),
            ready_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let registry = Arc::new(SessionRegistry::new(
            PortAllocator::new(17000, 17000 + pool_size - 1),
            owners.clone(),
            engine.clone(),
            config,
        ));
        Harness {
            registry,
            engine,
            owners,
            _dir: dir,
        }
    }

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_session_id());
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let h = harness(10, 3);
        let id = h.registry.create("alice").await.unwrap();

        let session = h.registry.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Running);
        assert_eq!(session.owner, "alice");
        assert_eq!(session.port, 17000);
        assert_eq!(h.owners.get(&id).as_deref(), Some("alice"));
        assert_eq!(h.registry.ports_available(), 9);
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let h = harness(10, 2);
        h.registry.create("alice").await.unwrap();
        h.registry.create("alice").await.unwrap();

        let err = h.registry.create("alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::QuotaExceeded { limit: 2 }));
        // quota failure happens before port allocation
        assert_eq!(h.registry.ports_available(), 8);

        // other users are unaffected
        h.registry.create("bob").await.unwrap();
    }

    #[tokio::test]
    async fn test_ports_exhausted() {
        let h = harness(1, 5);
        h.registry.create("alice").await.unwrap();

        let err = h.registry.create("alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::PortsExhausted));
        assert_eq!(h.registry.ports_available(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_compensates() {
        let h = harness(5, 3);
        h.engine.fail_create.store(true, Ordering::SeqCst);

        let err = h.registry.create("alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::ContainerStartFailed(_)));
        assert_eq!(h.registry.ports_available(), 5);
        assert!(h.owners.list_by_user("alice").is_empty());
        assert!(h.registry.sessions_for("alice").is_empty());
    }

    #[tokio::test]
    async fn test_engine_down_is_transient() {
        let h = harness(5, 3);
        h.engine.engine_down.store(true, Ordering::SeqCst);

        let err = h.registry.create("alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::EngineUnreachable(_)));
        assert_eq!(h.registry.ports_available(), 5);
    }

    #[tokio::test]
    async fn test_ready_timeout_removes_container() {
        let h = harness(5, 3);
        h.engine.fail_ready.store(true, Ordering::SeqCst);

        let err = h.registry.create("alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::ContainerStartFailed(_)));
        assert_eq!(h.engine.removed.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.ports_available(), 5);
        assert!(h.owners.list_by_user("alice").is_empty());
    }

    #[tokio::test]
    async fn test_delete_returns_port_and_removes_ownership() {
        let h = harness(5, 3);
        let id = h.registry.create("alice").await.unwrap();
        assert_eq!(h.registry.ports_available(), 4);

        let outcome = h.registry.delete(&id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(h.registry.get(&id).is_none());
        assert_eq!(h.owners.get(&id), None);
        assert_eq!(h.registry.ports_available(), 5);

        // port can be reused
        let id2 = h.registry.create("alice").await.unwrap();
        assert_eq!(h.registry.get(&id2).unwrap().port, 17000);
    }

    #[tokio::test]
    async fn test_double_delete_is_not_found() {
        let h = harness(5, 3);
        let id = h.registry.create("alice").await.unwrap();

        h.registry.delete(&id).await.unwrap();
        let err = h.registry.delete(&id).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound));
        // teardown did not run twice
        assert_eq!(h.engine.removed.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.ports_available(), 5);
    }

    #[tokio::test]
    async fn test_delete_defers_to_last_release() {
        let h = harness(5, 3);
        let id = h.registry.create("alice").await.unwrap();

        let handle = h.registry.acquire(&id).unwrap();
        let outcome = h.registry.delete(&id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Marked);

        // session still present, container untouched, port still held
        let session = h.registry.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Terminating);
        assert_eq!(h.engine.removed.load(Ordering::SeqCst), 0);
        assert_eq!(h.registry.ports_available(), 4);

        handle.release().await;

        assert!(h.registry.get(&id).is_none());
        assert_eq!(h.engine.removed.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.ports_available(), 5);
        assert_eq!(h.owners.get(&id), None);
    }

    #[tokio::test]
    async fn test_acquire_refused_after_delete_mark() {
        let h = harness(5, 3);
        let id = h.registry.create("alice").await.unwrap();

        let handle = h.registry.acquire(&id).unwrap();
        h.registry.delete(&id).await.unwrap();

        let err = h.registry.acquire(&id).unwrap_err();
        assert!(matches!(err, RegistryError::PendingDelete));

        handle.release().await;
    }

    #[tokio::test]
    async fn test_acquire_not_found() {
        let h = harness(5, 3);
        let err = h.registry.acquire("deadbeef").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound));
    }

    #[tokio::test]
    async fn test_dropped_handle_still_releases() {
        let h = harness(5, 3);
        let id = h.registry.create("alice").await.unwrap();

        {
            let _handle = h.registry.acquire(&id).unwrap();
            h.registry.delete(&id).await.unwrap();
        }

        // The drop backstop releases via a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.registry.get(&id).is_none());
        assert_eq!(h.registry.ports_available(), 5);
    }

    #[tokio::test]
    async fn test_multiple_refs() {
        let h = harness(5, 3);
        let id = h.registry.create("alice").await.unwrap();

        let h1 = h.registry.acquire(&id).unwrap();
        let h2 = h.registry.acquire(&id).unwrap();
        h.registry.delete(&id).await.unwrap();

        h1.release().await;
        assert!(h.registry.get(&id).is_some());

        h2.release().await;
        assert!(h.registry.get(&id).is_none());
        assert_eq!(h.engine.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_adopt_reserves_port() {
        let h = harness(5, 3);
        h.owners.put("cafebabe", "alice").unwrap();
        assert!(h.registry.adopt(
            "cafebabe",
            "alice",
            17002,
            "session-cafebabe",
            "cid-1",
            SessionState::Running,
            Utc::now(),
        ));
        assert_eq!(h.registry.ports_available(), 4);
        assert_eq!(h.registry.get("cafebabe").unwrap().port, 17002);

        // adopting the same port again fails
        assert!(!h.registry.adopt(
            "deadbeef",
            "bob",
            17002,
            "session-deadbeef",
            "cid-2",
            SessionState::Running,
            Utc::now(),
        ));
    }
}
