use std::collections::HashSet;
use std::io::{self, IsTerminal, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use log::{error, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

mod api;
mod auth;
mod container;
mod recovery;
mod session;
mod ws;

use api::AppState;
use auth::{AuthFile, AuthInner, AuthState, IdentityVerifier, LoginRateLimiter, TokenStore};
use container::{CliEngine, ContainerEngine, RuntimeType};
use session::{OwnershipStore, PortAllocator, RegistryConfig, SessionRegistry};

const APP_NAME: &str = "trmnl";

/// How often expired tokens are swept.
const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .common
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.toml", APP_NAME)));
    let config = load_or_init_config(&config_path, &cli.common)?;

    init_logging(&cli.common, &config)?;

    match cli.command {
        Command::Serve(cmd) => async_serve(config, cmd),
        Command::HashPassword => handle_hash_password(),
        Command::Config { command } => handle_config(&config_path, &config, command),
    }
}

#[tokio::main]
async fn async_serve(config: AppConfig, cmd: ServeCommand) -> Result<()> {
    handle_serve(config, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "trmnl - web terminal orchestrator.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve(ServeCommand),
    /// Read a password from stdin and print its bcrypt hash for the auth file
    HashPassword,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
    /// Container image for new sessions (overrides config)
    #[arg(long)]
    image: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct AppConfig {
    server: ServerConfig,
    ports: PortRangeConfig,
    sessions: SessionsConfig,
    container: ContainerConfig,
    paths: PathsConfig,
    auth: AuthPathConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    /// Bind address. Loopback is enforced when authentication is disabled.
    host: String,
    /// Listen port.
    port: u16,
    /// Maximum upload size in megabytes.
    max_upload_size_mb: usize,
    /// Mark the session cookie Secure (on whenever TLS fronts the server).
    cookie_secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            max_upload_size_mb: 100,
            cookie_secure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PortRangeConfig {
    lo: u16,
    hi: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            lo: 17000,
            hi: 17999,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionsConfig {
    max_per_user: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self { max_per_user: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerConfig {
    /// Image run for every session.
    image: String,
    /// Memory limit per container, bytes.
    memory_bytes: u64,
    /// CPU limit per container; zero disables the limit.
    cpus: f64,
    /// Seconds to wait for the terminal daemon after container start.
    ready_timeout_secs: u64,
    /// Mount point of the workspace inside the container.
    workspace_mount: String,
    /// Force docker or podman instead of auto-detecting.
    runtime: Option<RuntimeType>,
    /// Custom engine binary path.
    binary: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "trmnl-session:latest".to_string(),
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpus: 0.0,
            ready_timeout_secs: 30,
            workspace_mount: "/workspace".to_string(),
            runtime: None,
            binary: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    /// Directory for persistent state (ownership records, workspaces).
    data_dir: String,
    /// Host directory holding per-session workspaces.
    workspace_root: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            workspace_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct AuthPathConfig {
    /// Path to the auth file. Absence disables authentication and forces
    /// loopback-only binding.
    file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn load_or_init_config(path: &Path, common: &CommonOpts) -> Result<AppConfig> {
    if !path.exists() && common.config.is_none() {
        write_default_config(path)?;
    }

    let built = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix("TRMNL").separator("__"))
        .build()
        .context("building configuration")?;

    let config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {parent:?}"))?;
        }
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {}\n\n", APP_NAME);
    body.push_str(&toml);
    std::fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn init_logging(common: &CommonOpts, config: &AppConfig) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if common.quiet {
        log::set_max_level(LevelFilter::Off);
        return Ok(());
    }

    let level = match effective_log_level(common, config) {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

    let disable_color =
        common.no_color || std::env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
        .try_init()
        .ok();

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(effective_log_level(common, config));
    builder.try_init().ok();

    Ok(())
}

fn effective_log_level(common: &CommonOpts, config: &AppConfig) -> LevelFilter {
    if common.trace {
        LevelFilter::Trace
    } else if common.debug || common.verbose >= 1 {
        LevelFilter::Debug
    } else {
        match config.logging.level.as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn handle_hash_password() -> Result<()> {
    let mut password = String::new();
    io::stdin()
        .read_to_string(&mut password)
        .context("reading password from stdin")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("empty password");
    }
    let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST).context("hashing password")?;
    println!("{hash}");
    Ok(())
}

fn handle_config(path: &Path, config: &AppConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let toml = toml::to_string_pretty(config).context("serializing configuration")?;
            print!("{toml}");
        }
        ConfigCommand::Path => {
            println!("{}", path.display());
        }
    }
    Ok(())
}

const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "localhost", "::1"];

async fn handle_serve(config: AppConfig, cmd: ServeCommand) -> Result<()> {
    info!("starting {} server...", APP_NAME);

    let host = cmd.host.unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);

    // Authentication: present auth file enables it, absence means
    // loopback-only anonymous mode.
    let auth_file = config
        .auth
        .file
        .as_deref()
        .map(PathBuf::from)
        .filter(|p| p.exists());

    let auth_state = match auth_file {
        Some(ref path) => {
            let parsed = AuthFile::load(path)?;
            let admins: HashSet<String> = parsed
                .users
                .iter()
                .filter(|(_, u)| u.admin)
                .map(|(name, _)| name.clone())
                .collect();
            let tokens = Arc::new(TokenStore::new(parsed.session_timeout_hours()));
            auth::spawn_sweeper(tokens.clone(), TOKEN_SWEEP_INTERVAL);
            let timeout_hours = parsed.session_timeout_hours();
            let verifier = IdentityVerifier::new(parsed.users, parsed.directory);
            info!(
                "authentication enabled (token lifetime {}h, {} admin user(s))",
                timeout_hours,
                admins.len()
            );
            AuthState::enabled(AuthInner {
                verifier,
                tokens,
                limiter: LoginRateLimiter::default(),
                admins,
                cookie_secure: config.server.cookie_secure,
            })
        }
        None => {
            if config.auth.file.is_some() {
                warn!("configured auth file does not exist; authentication disabled");
            }
            if !LOOPBACK_HOSTS.contains(&host.as_str()) {
                bail!(
                    "refusing to bind {} without authentication. \
                     Create an auth file (auth.file in {}.toml) or bind to 127.0.0.1.",
                    host,
                    APP_NAME
                );
            }
            warn!("no auth file configured - running unauthenticated on loopback");
            AuthState::disabled()
        }
    };

    // Persistent state
    let data_dir = PathBuf::from(&config.paths.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let workspace_root = config
        .paths
        .workspace_root
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("workspaces"));
    std::fs::create_dir_all(&workspace_root)
        .with_context(|| format!("creating workspace root {}", workspace_root.display()))?;

    let owners = Arc::new(OwnershipStore::load(data_dir.join("session_owners.json")));

    // Container engine
    let engine_impl = match (&config.container.runtime, &config.container.binary) {
        (Some(rt), Some(binary)) => CliEngine::with_binary(*rt, binary.clone()),
        (Some(rt), None) => CliEngine::with_type(*rt),
        (None, _) => CliEngine::new(),
    };
    match engine_impl.health_check().await {
        Ok(_) => info!(
            "container engine ({}) is available",
            engine_impl.runtime_type()
        ),
        Err(e) => warn!(
            "container engine health check failed: {}. Session operations may fail.",
            e
        ),
    }
    let engine: Arc<dyn ContainerEngine> = Arc::new(engine_impl);

    // Session registry
    if config.ports.lo > config.ports.hi {
        bail!(
            "invalid port range: {} > {}",
            config.ports.lo,
            config.ports.hi
        );
    }
    let registry_config = RegistryConfig {
        max_sessions_per_user: config.sessions.max_per_user,
        image: cmd.image.unwrap_or_else(|| config.container.image.clone()),
        memory_bytes: config.container.memory_bytes,
        cpus: config.container.cpus,
        ready_timeout: Duration::from_secs(config.container.ready_timeout_secs),
        workspace_root,
        workspace_mount: config.container.workspace_mount.clone(),
    };
    let registry = Arc::new(SessionRegistry::new(
        PortAllocator::new(config.ports.lo, config.ports.hi),
        owners.clone(),
        engine.clone(),
        registry_config,
    ));

    recovery::recover_sessions(&registry, &owners, &engine).await;
    recovery::spawn_cleanup(registry.clone(), owners.clone(), engine.clone());

    let state = AppState::new(registry, owners, engine, auth_state);
    ws::spawn_transport_reaper(state.transports.clone());

    let app = api::create_router(state, config.server.max_upload_size_mb);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .or_else(|_| format!("{}:{}", "127.0.0.1", port).parse())
        .context("parsing bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("{} server stopped", APP_NAME);
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM so in-flight requests can drain.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining connections...");
}
