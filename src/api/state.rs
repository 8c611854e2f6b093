//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::container::ContainerEngine;
use crate::session::{OwnershipStore, SessionRegistry};
use crate::ws::LongPollTransports;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session registry owning every live session.
    pub registry: Arc<SessionRegistry>,
    /// Durable ownership records, consulted by the gate.
    pub owners: Arc<OwnershipStore>,
    /// Container engine, for status reporting.
    pub engine: Arc<dyn ContainerEngine>,
    /// Authentication state.
    pub auth: AuthState,
    /// Active HTTP long-poll terminal transports.
    pub transports: Arc<LongPollTransports>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        owners: Arc<OwnershipStore>,
        engine: Arc<dyn ContainerEngine>,
        auth: AuthState,
    ) -> Self {
        Self {
            registry,
            owners,
            engine,
            auth,
            transports: Arc::new(LongPollTransports::new()),
        }
    }
}
