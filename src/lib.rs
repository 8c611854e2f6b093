//! trmnl library.
//!
//! Core components of the web terminal orchestrator: per-user ttyd
//! containers behind an authenticated HTTP/WebSocket surface.

pub mod api;
pub mod auth;
pub mod container;
pub mod recovery;
pub mod session;
pub mod ws;
