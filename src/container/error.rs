//! Container engine error types.

use thiserror::Error;

/// Result type for container engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur talking to the container engine.
///
/// `Unreachable` is transient (the engine daemon itself is down or the CLI is
/// missing); everything else describes a failure of the requested operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine daemon could not be reached at all.
    #[error("container engine unreachable: {0}")]
    Unreachable(String),

    /// A container failed to start.
    #[error("container {name} failed to start: {message}")]
    StartFailed { name: String, message: String },

    /// The engine command exited with a failure.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The terminal daemon did not answer on its port in time.
    #[error("terminal daemon on port {port} not ready after {waited_secs}s")]
    NotReady { port: u16, waited_secs: u64 },

    /// Failed to parse engine output.
    #[error("failed to parse engine output: {0}")]
    Parse(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Patterns in engine stderr that mean the daemon is down rather than the
/// container being at fault.
const UNREACHABLE_MARKERS: &[&str] = &[
    "cannot connect to the docker daemon",
    "error: unable to connect to podman",
    "connection refused",
    "is the docker daemon running",
    "no such file or directory",
];

impl EngineError {
    /// Classify a failed CLI invocation: daemon-down stderr becomes
    /// `Unreachable`, anything else stays a command failure.
    pub fn from_cli_failure(command: &str, stderr: &str) -> Self {
        let lowered = stderr.to_lowercase();
        if UNREACHABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
            EngineError::Unreachable(stderr.trim().to_string())
        } else {
            EngineError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            }
        }
    }

    /// Whether this error means the engine itself is down.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, EngineError::Unreachable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        let err = EngineError::from_cli_failure(
            "run",
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
        );
        assert!(err.is_unreachable());

        let err = EngineError::from_cli_failure("run", "no such image: nope:latest");
        assert!(!err.is_unreachable());
    }
}
