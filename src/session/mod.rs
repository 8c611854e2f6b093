//! Session management module.
//!
//! Owns the lifecycle of terminal sessions: the authoritative registry,
//! the host port pool, and the durable ownership records.

mod models;
mod owners;
mod ports;
mod registry;

pub use models::{BatchStatusEntry, BatchStatusRequest, Session, SessionState};
pub use owners::{OwnerRecord, OwnershipStore, StoreError};
pub use ports::PortAllocator;
pub use registry::{
    container_name_for, new_session_id, DeleteOutcome, RegistryConfig, RegistryError,
    SessionHandle, SessionRegistry,
};
