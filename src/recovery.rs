//! Startup recovery and background cleanup.
//!
//! Session containers survive server restarts (restart policy
//! `unless-stopped`), so on boot the engine is the source of truth: every
//! container named `session-*` with a matching ownership record is
//! re-registered, stopped ones are restarted, and anything unmatchable is
//! removed. A periodic task then keeps the registry, the ownership store,
//! and the engine agreeing with each other.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::container::{ContainerEngine, CONTAINER_NAME_PREFIX};
use crate::session::{container_name_for, OwnershipStore, SessionRegistry, SessionState};

/// How often the cleanup pass runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Re-register sessions from containers left by a previous run.
pub async fn recover_sessions(
    registry: &Arc<SessionRegistry>,
    owners: &Arc<OwnershipStore>,
    engine: &Arc<dyn ContainerEngine>,
) {
    let discovered = match engine.discover_session_containers().await {
        Ok(list) => list,
        Err(e) => {
            error!("failed to list existing containers: {}", e);
            return;
        }
    };

    let mut recovered = 0usize;
    for container in discovered {
        let Some(short_id) = container.name.strip_prefix(CONTAINER_NAME_PREFIX) else {
            continue;
        };

        // Ownership records carry the full id; containers only the prefix.
        let session_id = owners
            .all_ids()
            .into_iter()
            .find(|id| id.starts_with(short_id));

        let (Some(session_id), Some(port)) = (session_id, container.host_port) else {
            warn!(
                "removing unmatchable container {} (owner or port unknown)",
                container.name
            );
            if let Err(e) = engine.remove(&container.name).await {
                error!("failed to remove container {}: {}", container.name, e);
            }
            continue;
        };
        let Some(owner) = owners.get(&session_id) else {
            continue;
        };

        let state = if container.status == "running" {
            SessionState::Running
        } else {
            info!(
                "restarting stopped container {} (status: {})",
                container.name, container.status
            );
            if let Err(e) = engine.start(&container.name).await {
                warn!(
                    "container {} failed to restart: {}; removing",
                    container.name, e
                );
                if let Err(e) = engine.remove(&container.name).await {
                    error!("failed to remove container {}: {}", container.name, e);
                }
                if let Err(e) = owners.remove(&session_id) {
                    error!("failed to drop ownership record for {}: {}", session_id, e);
                }
                continue;
            }
            SessionState::Starting
        };

        let created_at = container.created_at.unwrap_or_else(chrono::Utc::now);
        if !registry.adopt(
            &session_id,
            &owner,
            port,
            &container.name,
            &container.id,
            state,
            created_at,
        ) {
            warn!("could not adopt session {}; removing container", session_id);
            if let Err(e) = engine.remove(&container.name).await {
                error!("failed to remove container {}: {}", container.name, e);
            }
            continue;
        }

        if state == SessionState::Starting {
            // Flip to Running once the daemon answers; give up quietly if
            // it never does, the cleanup pass will deal with it.
            let registry = registry.clone();
            let engine = engine.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                if engine
                    .await_ready(port, Duration::from_secs(30))
                    .await
                    .is_ok()
                {
                    registry.mark_running(&session_id);
                }
            });
        }

        info!(
            "recovered session {} (container {}, port {})",
            &session_id[..12.min(session_id.len())],
            container.name,
            port
        );
        recovered += 1;
    }

    // Ownership entries with no container behind them are dead weight.
    for session_id in owners.all_ids() {
        if registry.get(&session_id).is_some() {
            continue;
        }
        let container = container_name_for(&session_id);
        match engine.state_status(&container).await {
            Ok(None) => {
                info!("removing orphaned ownership record for {}", session_id);
                if let Err(e) = owners.remove(&session_id) {
                    error!("failed to drop ownership record for {}: {}", session_id, e);
                }
            }
            Ok(Some(_)) | Err(_) => {}
        }
    }

    if recovered > 0 {
        info!("recovered {} session(s) from previous run", recovered);
    }
}

/// Run the periodic consistency pass until the process exits.
pub fn spawn_cleanup(
    registry: Arc<SessionRegistry>,
    owners: Arc<OwnershipStore>,
    engine: Arc<dyn ContainerEngine>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            cleanup_pass(&registry, &owners, &engine).await;
        }
    });
}

async fn cleanup_pass(
    registry: &Arc<SessionRegistry>,
    owners: &Arc<OwnershipStore>,
    engine: &Arc<dyn ContainerEngine>,
) {
    for session in registry.all_sessions() {
        if session.state == SessionState::Terminating {
            continue;
        }

        match engine.state_status(&session.container_name).await {
            Ok(Some(status)) if status == "running" => {}
            Ok(Some(status)) if status == "exited" || status == "dead" => {
                match engine.start(&session.container_name).await {
                    Ok(()) => {
                        info!("restarted dead container for session {}", session.id);
                    }
                    Err(e) => {
                        warn!(
                            "container for session {} cannot be restarted ({}); tearing down",
                            session.id, e
                        );
                        if let Err(e) = registry.delete(&session.id).await {
                            error!("cleanup delete for {} failed: {}", session.id, e);
                        }
                    }
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                info!(
                    "container for session {} vanished; tearing down",
                    session.id
                );
                if let Err(e) = registry.delete(&session.id).await {
                    error!("cleanup delete for {} failed: {}", session.id, e);
                }
            }
            Err(e) => {
                // Engine is unreachable; try again next pass.
                warn!("cleanup pass skipped: {}", e);
                return;
            }
        }
    }

    for session_id in owners.all_ids() {
        if registry.get(&session_id).is_some() {
            continue;
        }
        let container = container_name_for(&session_id);
        match engine.state_status(&container).await {
            Ok(None) => {
                info!("removing orphaned ownership record for {}", session_id);
                if let Err(e) = owners.remove(&session_id) {
                    error!("failed to drop ownership record for {}: {}", session_id, e);
                }
            }
            Ok(Some(_)) | Err(_) => {}
        }
    }
}
