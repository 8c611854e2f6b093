//! HTTP API module.
//!
//! REST endpoints for the session lifecycle plus the terminal transports.

mod error;
mod files;
pub mod handlers;
mod pages;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
