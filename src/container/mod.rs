//! Container engine integration.
//!
//! Thin async adapter over the Docker or Podman CLI. Every session owns
//! exactly one container running the ttyd terminal daemon; this module
//! creates, inspects, and removes those containers and polls the daemon
//! for readiness.

mod error;

pub use error::{EngineError, EngineResult};

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Port ttyd listens on inside every session container.
pub const TERMINAL_DAEMON_PORT: u16 = 7681;

/// Name prefix for containers managed by this server.
pub const CONTAINER_NAME_PREFIX: &str = "session-";

/// Which container CLI drives the session containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    #[default]
    Podman,
}

impl RuntimeType {
    /// CLI binary this runtime is driven through.
    pub fn binary(self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Volume argument mounting a session workspace. Podman usually runs
    /// SELinux-confined, so its mounts carry the relabel flag; plain
    /// host:mount would leave the workspace unwritable from inside.
    pub fn volume_arg(self, host: &std::path::Path, mount: &str) -> String {
        match self {
            RuntimeType::Docker => format!("{}:{}", host.display(), mount),
            RuntimeType::Podman => format!("{}:{}:Z", host.display(), mount),
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

/// A CLI argument that is supposed to name one of our containers: the
/// `session-<hex>` name the registry assigns, or a raw hex id the engine
/// handed back. Anything else never originates in this server and is
/// refused before it reaches a command line.
fn ensure_session_ref(arg: &str) -> EngineResult<()> {
    let hex_only = |s: &str| {
        !s.is_empty() && s.len() <= 64 && s.chars().all(|c| c.is_ascii_hexdigit())
    };
    let ok = match arg.strip_prefix(CONTAINER_NAME_PREFIX) {
        Some(suffix) => hex_only(suffix),
        None => hex_only(arg),
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::InvalidInput(format!(
            "'{}' does not name a session container",
            arg
        )))
    }
}

/// Parameters for creating a session container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name (`session-<id>` by convention).
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Host port bound on loopback, forwarded to the terminal daemon.
    pub host_port: u16,
    /// Host workspace directory mounted into the container.
    pub workspace: std::path::PathBuf,
    /// Mount target inside the container.
    pub workspace_mount: String,
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// CPU limit (fractional cores); zero means unlimited.
    pub cpus: f64,
    /// Hostname inside the container.
    pub hostname: String,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl ContainerSpec {
    /// Refuse anything that could not have come from the session registry.
    /// The name must be a session container name, the image a plain
    /// registry reference, and the port one the allocator could have
    /// handed out.
    pub fn validate(&self) -> EngineResult<()> {
        ensure_session_ref(&self.name)?;

        let image_ok = !self.image.is_empty()
            && self
                .image
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'));
        if !image_ok {
            return Err(EngineError::InvalidInput(format!(
                "image reference '{}' is not usable",
                self.image
            )));
        }

        if self.host_port == 0 {
            return Err(EngineError::InvalidInput(
                "host port must be nonzero".to_string(),
            ));
        }

        Ok(())
    }
}

/// A session container discovered from the engine at startup.
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
    /// Container id.
    pub id: String,
    /// Container name (carries the session id suffix).
    pub name: String,
    /// Engine status string ("running", "exited", ...).
    pub status: String,
    /// Host port bound to the terminal daemon, if any.
    pub host_port: Option<u16>,
    /// When the engine created the container.
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Container engine abstraction.
///
/// The production implementation shells out to docker/podman; tests supply a
/// stub so the session registry can be exercised without an engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create and start a container; returns the container id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> EngineResult<String>;

    /// Force-remove a container. Removing a container that is already gone
    /// is a success.
    async fn remove(&self, name_or_id: &str) -> EngineResult<()>;

    /// Start a stopped container.
    async fn start(&self, name_or_id: &str) -> EngineResult<()>;

    /// Engine status string for a container, or `None` when it does not exist.
    async fn state_status(&self, name_or_id: &str) -> EngineResult<Option<String>>;

    /// Wait until the terminal daemon answers HTTP on `port`.
    async fn await_ready(&self, port: u16, deadline: Duration) -> EngineResult<()>;

    /// All session containers known to the engine, running or not.
    async fn discover_session_containers(&self) -> EngineResult<Vec<DiscoveredContainer>>;
}

/// Check whether a container CLI is installed and answers at all.
fn cli_answers(binary: &str) -> bool {
    std::process::Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Container engine client backed by the docker or podman CLI.
#[derive(Debug, Clone)]
pub struct CliEngine {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for CliEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CliEngine {
    /// Auto-detect the runtime by probing each CLI, podman preferred.
    /// When neither answers the default is kept and the first engine call
    /// reports it as unreachable.
    pub fn new() -> Self {
        for runtime_type in [RuntimeType::Podman, RuntimeType::Docker] {
            if cli_answers(runtime_type.binary()) {
                return Self::with_type(runtime_type);
            }
        }
        Self::with_type(RuntimeType::default())
    }

    /// Create an engine client with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.binary().to_string(),
            runtime_type,
        }
    }

    /// Create an engine client with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if the container engine is available and working.
    pub async fn health_check(&self) -> EngineResult<String> {
        let output = self.run(&["version", "--format", "json"]).await?;
        Ok(output)
    }

    /// Run the engine CLI and collect stdout; classifies failures.
    async fn run(&self, args: &[&str]) -> EngineResult<String> {
        let command = args.first().copied().unwrap_or_default();
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Unreachable(format!("{}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::from_cli_failure(command, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    async fn create_and_start(&self, spec: &ContainerSpec) -> EngineResult<String> {
        spec.validate()?;

        let mut args: Vec<String> = Vec::new();

        args.push("run".to_string());
        args.push("-d".to_string());

        args.push("--name".to_string());
        args.push(spec.name.clone());

        args.push("--hostname".to_string());
        args.push(spec.hostname.clone());

        // Loopback-only binding: the daemon must never be reachable except
        // through the proxy.
        args.push("-p".to_string());
        args.push(format!(
            "127.0.0.1:{}:{}",
            spec.host_port, TERMINAL_DAEMON_PORT
        ));

        args.push("-v".to_string());
        args.push(
            self.runtime_type
                .volume_arg(&spec.workspace, &spec.workspace_mount),
        );

        args.push("--memory".to_string());
        args.push(spec.memory_bytes.to_string());

        if spec.cpus > 0.0 {
            args.push("--cpus".to_string());
            args.push(format!("{}", spec.cpus));
        }

        args.push("--restart".to_string());
        args.push("unless-stopped".to_string());

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = match self.run(&arg_refs).await {
            Ok(out) => out,
            Err(EngineError::CommandFailed { message, .. }) => {
                return Err(EngineError::StartFailed {
                    name: spec.name.clone(),
                    message,
                });
            }
            Err(e) => return Err(e),
        };

        Ok(stdout.trim().to_string())
    }

    async fn remove(&self, name_or_id: &str) -> EngineResult<()> {
        ensure_session_ref(name_or_id)?;

        match self.run(&["rm", "-f", name_or_id]).await {
            Ok(_) => Ok(()),
            // Already-gone containers count as removed.
            Err(EngineError::CommandFailed { message, .. })
                if message.to_lowercase().contains("no such container") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn start(&self, name_or_id: &str) -> EngineResult<()> {
        ensure_session_ref(name_or_id)?;
        self.run(&["start", name_or_id]).await.map(|_| ())
    }

    async fn state_status(&self, name_or_id: &str) -> EngineResult<Option<String>> {
        ensure_session_ref(name_or_id)?;

        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Status}}", name_or_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Unreachable(format!("{}: {}", self.binary, e)))?;

        // a failed inspect means the container is gone
        if !output.status.success() {
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!status.is_empty()).then_some(status))
    }

    async fn await_ready(&self, port: u16, deadline: Duration) -> EngineResult<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| EngineError::Parse(e.to_string()))?;

        let url = format!("http://127.0.0.1:{}/", port);
        let start = tokio::time::Instant::now();

        loop {
            let ok = client
                .get(&url)
                .send()
                .await
                .map(|res| res.status().is_success())
                .unwrap_or(false);

            if ok {
                return Ok(());
            }

            if start.elapsed() >= deadline {
                return Err(EngineError::NotReady {
                    port,
                    waited_secs: deadline.as_secs(),
                });
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn discover_session_containers(&self) -> EngineResult<Vec<DiscoveredContainer>> {
        let stdout = self
            .run(&[
                "ps",
                "-a",
                "--filter",
                &format!("name={}", CONTAINER_NAME_PREFIX),
                "--format",
                "{{.Names}}",
            ])
            .await?;

        let mut discovered = Vec::new();
        for name in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.inspect_discovered(name).await {
                Ok(Some(container)) => discovered.push(container),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("failed to inspect container {}: {}", name, e);
                }
            }
        }

        Ok(discovered)
    }
}

impl CliEngine {
    /// Inspect one container and pull out the fields recovery needs.
    async fn inspect_discovered(&self, name: &str) -> EngineResult<Option<DiscoveredContainer>> {
        ensure_session_ref(name)?;

        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "json", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Unreachable(format!("{}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: Vec<serde_json::Value> =
            serde_json::from_str(&stdout).map_err(|e| EngineError::Parse(e.to_string()))?;
        let Some(info) = parsed.into_iter().next() else {
            return Ok(None);
        };

        let id = info["Id"].as_str().unwrap_or_default().to_string();
        let status = info["State"]["Status"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        // First host binding of the terminal daemon port.
        let host_port = info["HostConfig"]["PortBindings"]
            .as_object()
            .and_then(|bindings| {
                bindings
                    .values()
                    .filter_map(|b| b.as_array())
                    .flatten()
                    .find_map(|b| b["HostPort"].as_str())
            })
            .and_then(|p| p.parse::<u16>().ok());

        let created_at = info["Created"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(Some(DiscoveredContainer {
            id,
            name: name.to_string(),
            status,
            host_port,
            created_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, image: &str, port: u16) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            host_port: port,
            workspace: std::path::PathBuf::from("/srv/ws"),
            workspace_mount: "/workspace".to_string(),
            memory_bytes: 1024,
            cpus: 0.0,
            hostname: name.to_string(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_volume_arg_relabels_only_for_podman() {
        let host = std::path::Path::new("/srv/ws");
        assert_eq!(
            RuntimeType::Docker.volume_arg(host, "/workspace"),
            "/srv/ws:/workspace"
        );
        assert_eq!(
            RuntimeType::Podman.volume_arg(host, "/workspace"),
            "/srv/ws:/workspace:Z"
        );
    }

    #[test]
    fn test_session_refs_only() {
        assert!(ensure_session_ref("session-0af1c2d3e4f5").is_ok());
        // raw engine ids are hex
        assert!(ensure_session_ref("deadbeefcafe").is_ok());
        assert!(ensure_session_ref("session-").is_err());
        assert!(ensure_session_ref("someones-container").is_err());
        assert!(ensure_session_ref("session-0af1; rm -rf /").is_err());
        assert!(ensure_session_ref("").is_err());
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec("session-0af1c2", "trmnl-session:latest", 17000)
            .validate()
            .is_ok());
        assert!(spec("build-box", "trmnl-session:latest", 17000)
            .validate()
            .is_err());
        assert!(spec("session-0af1c2", "img$(touch pwned)", 17000)
            .validate()
            .is_err());
        assert!(spec("session-0af1c2", "trmnl-session:latest", 0)
            .validate()
            .is_err());
    }
}
