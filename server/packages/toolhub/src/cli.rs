use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use toolhub_error::HubError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::AppState;
use crate::config::{ConfigSource, FileConfigSource, ToolhubConfig};
use crate::db::DbError;
use crate::hub::ConnectionHub;
use crate::sandbox::{ContainerSession, CreateContainerParams, NetworkMode, SandboxError};
use crate::store::{DbAccess, InMemoryChatStore};

const CONFIG_DIR_NAME: &str = "toolhub";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Parser, Debug)]
#[command(name = "toolhub", bin_name = "toolhub", version)]
#[command(about = "Tool server hub and sandbox callback proxy")]
#[command(arg_required_else_help = true)]
pub struct ToolhubCli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file. Defaults to the platform config dir.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Supervise configured tool servers and serve the sandbox callback proxy.
    Serve(ServeArgs),
    /// Validate the configuration and print the resolved servers.
    CheckConfig,
    /// Connect to every configured server once and print snapshots as JSON.
    Servers,
    /// Build and run one sandbox from a directory and print its result as JSON.
    Sandbox(SandboxArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Overrides the proxy bind host from the configuration.
    #[arg(long, short = 'H')]
    host: Option<String>,

    /// Overrides the proxy port from the configuration.
    #[arg(long, short = 'p')]
    port: Option<u16>,
}

#[derive(Args, Debug)]
pub struct SandboxArgs {
    /// Build context; must contain a Dockerfile.
    dir: PathBuf,

    /// Chat the container acts for through the callback proxy.
    #[arg(long, default_value = "cli")]
    chat: String,

    /// Database access of that chat, as JSON (e.g. `{"mode":"execute_sql_rollback"}`).
    #[arg(long)]
    access: Option<String>,

    /// `bridge` also serves the callback proxy for the duration of the run.
    #[arg(long, value_enum, default_value_t = SandboxNetwork::None)]
    network: SandboxNetwork,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    memory: Option<String>,

    /// `KEY=VALUE`, repeatable.
    #[arg(long = "env", short = 'e')]
    env: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SandboxNetwork {
    None,
    Bridge,
}

impl From<SandboxNetwork> for NetworkMode {
    fn from(network: SandboxNetwork) -> Self {
        match network {
            SandboxNetwork::None => NetworkMode::None,
            SandboxNetwork::Bridge => NetworkMode::Bridge,
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no config dir available; pass --config")]
    NoConfigDir,
    #[error("server error: {0}")]
    Server(String),
}

pub fn run() -> Result<(), CliError> {
    let cli = ToolhubCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    match &cli.command {
        Command::Serve(args) => run_serve(&config_path, args),
        Command::CheckConfig => run_check_config(&config_path),
        Command::Servers => run_servers(&config_path),
        Command::Sandbox(args) => run_sandbox(&config_path, args),
    }
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

fn default_config_path() -> Result<PathBuf, CliError> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(CliError::NoConfigDir)
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_check_config(path: &PathBuf) -> Result<(), CliError> {
    let config = ToolhubConfig::load(path)?;
    let servers = config.servers_config()?;
    let summary: serde_json::Map<String, serde_json::Value> = servers
        .iter()
        .map(|(name, server)| {
            (
                name.clone(),
                serde_json::json!({
                    "command": server.launch.display_command(),
                    "disabled": server.disabled,
                }),
            )
        })
        .collect();
    write_stdout_line(&serde_json::to_string_pretty(&summary)?)
}

fn run_servers(path: &PathBuf) -> Result<(), CliError> {
    let config = ToolhubConfig::load(path)?;
    let servers = config.servers_config()?;
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let hub = ConnectionHub::from_settings(&config.hub);
        hub.set_server_connections(&servers).await;
        let snapshots = hub.snapshots();
        hub.destroy_all().await;
        write_stdout_line(&serde_json::to_string_pretty(&snapshots)?)
    })
}

fn run_serve(path: &PathBuf, args: &ServeArgs) -> Result<(), CliError> {
    let mut config = ToolhubConfig::load(path)?;
    if let Some(host) = &args.host {
        config.proxy.host = host.clone();
    }
    if let Some(port) = args.port {
        config.proxy.port = port;
    }
    let state = Arc::new(AppState::from_config(
        &config,
        Arc::new(InMemoryChatStore::new()),
    )?);
    let router = state
        .proxy_router()
        .into_make_service_with_connect_info::<SocketAddr>();

    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let source = FileConfigSource::new(path.clone());
        state.hub().reload(&source).await?;
        let reloader = tokio::spawn(reload_on_hangup(state.hub().clone(), source));

        let settings = state.proxy_settings();
        let addr = settings.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, root = %settings.root_path, "sandbox proxy listening");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await;
        reloader.abort();
        state.shutdown().await;
        served.map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_sandbox(path: &PathBuf, args: &SandboxArgs) -> Result<(), CliError> {
    let config = ToolhubConfig::load(path)?;
    let access: DbAccess = match &args.access {
        Some(text) => serde_json::from_str(text)?,
        None => DbAccess::None,
    };
    let environment = parse_env_pairs(&args.env)?;
    let params = CreateContainerParams {
        files: read_build_context(&args.dir)?,
        timeout: args.timeout_ms,
        network_mode: Some(args.network.into()),
        environment: (!environment.is_empty()).then_some(environment),
        memory: args.memory.clone(),
        cpus: None,
    };
    let state = AppState::from_config(&config, Arc::new(InMemoryChatStore::new()))?;
    let session = ContainerSession::new(args.chat.clone(), access);

    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let proxy = match args.network {
            SandboxNetwork::Bridge => Some(spawn_proxy(&state).await?),
            SandboxNetwork::None => None,
        };
        let outcome = state.orchestrator().create_container(params, session).await;
        if let Some(proxy) = proxy {
            proxy.abort();
        }
        write_stdout_line(&serde_json::to_string_pretty(&outcome?)?)
    })
}

async fn spawn_proxy(state: &AppState) -> Result<tokio::task::JoinHandle<()>, CliError> {
    let addr = state.proxy_settings().bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "sandbox proxy listening for this run");
    let service = state
        .proxy_router()
        .into_make_service_with_connect_info::<SocketAddr>();
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, service).await {
            tracing::error!(error = %err, "sandbox proxy stopped");
        }
    }))
}

/// Every regular file under `dir`, keyed by its `/`-separated relative path.
fn read_build_context(dir: &Path) -> Result<BTreeMap<String, String>, CliError> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(dir)
                .map_err(|err| CliError::InvalidArgument(err.to_string()))?
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(relative, std::fs::read_to_string(&path)?);
        }
    }
    Ok(files)
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| CliError::InvalidArgument(format!("expected KEY=VALUE, got {pair}")))
        })
        .collect()
}

#[cfg(unix)]
async fn reload_on_hangup(hub: ConnectionHub, source: FileConfigSource) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for SIGHUP; config reload disabled");
            return;
        }
    };
    while hangups.recv().await.is_some() {
        tracing::info!(path = %source.path().display(), "reloading tool server config");
        if let Err(err) = hub.reload(&source as &dyn ConfigSource).await {
            tracing::error!(error = %err, "config reload failed; keeping current servers");
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_hub: ConnectionHub, _source: FileConfigSource) {}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_context_is_read_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine").unwrap();
        std::fs::create_dir_all(dir.path().join("src/lib")).unwrap();
        std::fs::write(dir.path().join("src/lib/job.py"), "print(1)").unwrap();

        let files = read_build_context(dir.path()).unwrap();
        assert_eq!(
            files.keys().cloned().collect::<Vec<_>>(),
            vec!["Dockerfile", "src/lib/job.py"]
        );
        assert_eq!(files["src/lib/job.py"], "print(1)");
    }

    #[test]
    fn env_pairs_need_an_equals_sign() {
        let env = parse_env_pairs(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(env["B"], "x=y");
        assert!(matches!(
            parse_env_pairs(&["A".to_string()]),
            Err(CliError::InvalidArgument(_))
        ));
    }

    #[test]
    fn sandbox_command_parses() {
        let cli = ToolhubCli::try_parse_from([
            "toolhub", "sandbox", "./job", "--network", "bridge", "-e", "A=1",
        ])
        .unwrap();
        match cli.command {
            Command::Sandbox(args) => {
                assert_eq!(args.network, SandboxNetwork::Bridge);
                assert_eq!(args.chat, "cli");
                assert_eq!(args.env, vec!["A=1"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
