//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Container created, terminal daemon not yet answering.
    Starting,
    /// Terminal daemon is reachable.
    Running,
    /// Deletion requested; resources are reclaimed once the last
    /// connection lets go.
    Terminating,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Terminating => write!(f, "terminating"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionState::Starting),
            "running" => Ok(SessionState::Running),
            "terminating" => Ok(SessionState::Terminating),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// Read-only snapshot of a live session.
///
/// Snapshots are copies; holding one confers no liveness guarantee. Anything
/// that must outlive its own critical section goes through a registry handle
/// instead.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Opaque 32-hex-char session id.
    pub id: String,
    /// Lifecycle state at snapshot time.
    pub state: SessionState,
    /// Host port the terminal daemon is bound to.
    pub port: u16,
    /// Owning username.
    pub owner: String,
    /// Container name at the engine.
    pub container_name: String,
    /// Container id returned by the engine at creation.
    pub container_id: String,
    /// Host directory mounted as the session workspace.
    pub workspace: std::path::PathBuf,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last authenticated touch.
    pub last_accessed: DateTime<Utc>,
}

/// Batch status request body.
#[derive(Debug, Deserialize)]
pub struct BatchStatusRequest {
    pub session_ids: Vec<String>,
}

/// One entry in the batch status response.
#[derive(Debug, Serialize)]
pub struct BatchStatusEntry {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            SessionState::Starting,
            SessionState::Running,
            SessionState::Terminating,
        ] {
            let text = state.to_string();
            assert_eq!(text.parse::<SessionState>().unwrap(), state);
        }
        assert!("zombie".parse::<SessionState>().is_err());
    }
}
