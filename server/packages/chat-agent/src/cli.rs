use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{BridgeConfig, DEFAULT_LOG_CHANNEL_CAPACITY, DEFAULT_MAX_TURNS};
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::router::{build_router_with_state, shutdown_sessions, AppState, AuthConfig};
use crate::sandbox::LocalSandboxProvider;
use crate::store::FileChatStore;
use crate::tokens::TokenPolicy;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2468;

#[derive(Parser, Debug)]
#[command(name = "chat-agent", bin_name = "chat-agent", version)]
#[command(about = "Sandboxed chat agent sessions behind one HTTP API")]
#[command(arg_required_else_help = true)]
pub struct ChatAgentCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true, env = "CHAT_AGENT_TOKEN")]
    token: Option<String>,

    #[arg(long, short = 'n', global = true)]
    no_token: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat agent HTTP server.
    Server(ServerArgs),
    /// Print the OpenAPI document and exit.
    Openapi,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Where sandboxes, snapshots and chat records live.
    #[arg(long, short = 'd')]
    data_dir: Option<PathBuf>,

    /// URL the runner scripts use to call back into this server.
    #[arg(long)]
    public_url: Option<String>,

    /// Base URL of the host application's backend API.
    #[arg(long)]
    backend_url: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_TURNS)]
    max_turns: usize,

    #[arg(long, default_value = "medium")]
    reasoning_effort: String,

    #[arg(long, default_value_t = 30 * 60)]
    token_ttl_secs: u64,

    #[arg(long, default_value_t = 60)]
    token_refresh_secs: u64,

    #[arg(long, default_value_t = DEFAULT_LOG_CHANNEL_CAPACITY)]
    log_channel_capacity: usize,

    /// Interpreter for the embedded runner scripts.
    #[arg(long, default_value = "node")]
    runner_program: String,

    /// Command run in each new sandbox before its first turn, e.g.
    /// `--install-command npm --install-command ci`.
    #[arg(long = "install-command")]
    install_command: Vec<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("missing token: pass --token or --no-token")]
    MissingToken,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_chat_agent() -> Result<(), CliError> {
    let cli = ChatAgentCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    match &cli.command {
        Command::Server(args) => run_server(&cli, args),
        Command::Openapi => {
            use utoipa::OpenApi;
            let document = crate::router::ApiDoc::openapi();
            println!("{}", serde_json::to_string_pretty(&document)?);
            Ok(())
        }
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

fn run_server(cli: &ChatAgentCli, server: &ServerArgs) -> Result<(), CliError> {
    let auth = match (&cli.token, cli.no_token) {
        (Some(token), _) => AuthConfig::with_token(token.clone()),
        (None, true) => AuthConfig::disabled(),
        (None, false) => return Err(CliError::MissingToken),
    };

    let data_dir = server.data_dir.clone().unwrap_or_else(default_data_dir);
    let provider = LocalSandboxProvider::new(&data_dir)
        .map_err(|err| CliError::Server(err.to_string()))?;
    let store = FileChatStore::new(data_dir.join("chats"))
        .map_err(|err| CliError::Server(err.to_string()))?;
    let registry = SessionRegistry::new(
        Arc::new(provider),
        Arc::new(store),
        RegistryConfig {
            token_policy: TokenPolicy {
                ttl: Duration::from_secs(server.token_ttl_secs),
                refresh_window: Duration::from_secs(server.token_refresh_secs),
            },
            install_command: server.install_command.clone(),
        },
    );

    let mut config = BridgeConfig {
        public_url: server
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", display_host(&server.host), server.port)),
        max_turns: server.max_turns,
        reasoning_effort: server.reasoning_effort.clone(),
        log_channel_capacity: server.log_channel_capacity,
        runner_program: server.runner_program.clone(),
        ..BridgeConfig::default()
    }
    .with_env();
    if let Some(url) = &server.backend_url {
        config.backend_url = Some(url.clone());
    }
    if config.backend_url.is_none() {
        tracing::warn!("no backend url configured; crud, workspace, drive and email tools are disabled");
    }

    let state = Arc::new(AppState::new(auth, registry, config));
    let (mut router, state) = build_router_with_state(state);
    router = router.layer(build_cors_layer(server)?);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, data_dir = %data_dir.display(), "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
                shutdown_sessions(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn display_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "::" => "localhost",
        other => other,
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHAT_AGENT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("chat-agent"))
        .unwrap_or_else(|| PathBuf::from(".").join(".chat-agent"))
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_args_parse() {
        let cli = ChatAgentCli::try_parse_from([
            "chat-agent",
            "--no-token",
            "server",
            "--port",
            "9000",
            "--install-command",
            "npm",
            "--install-command",
            "ci",
        ])
        .expect("parse");
        assert!(cli.no_token);
        match cli.command {
            Command::Server(args) => {
                assert_eq!(args.port, 9000);
                assert_eq!(args.install_command, vec!["npm", "ci"]);
                assert_eq!(args.max_turns, DEFAULT_MAX_TURNS);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn display_host_maps_wildcards() {
        assert_eq!(display_host("0.0.0.0"), "localhost");
        assert_eq!(display_host("10.0.0.2"), "10.0.0.2");
    }
}
