use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colloquy_protocol::PermissionMode;
use colloquy_runtime::{ProcessEngine, ProcessEngineConfig, SessionConfig, DEFAULT_WORKSPACE_DIR};
use colloquy_web::{ConversationServer, WebConfig, CONVERSATION_PATH};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "colloquy-server", about = "Serve agent conversations over WebSocket")]
struct Args {
    #[arg(long, env = "IDE_PORT", default_value_t = 3000)]
    port: u16,
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Directory the agent works in.
    #[arg(long, env = "WORKSPACE_DIR", default_value = DEFAULT_WORKSPACE_DIR)]
    workspace: PathBuf,
    /// Agent CLI executable.
    #[arg(long, env = "COLLOQUY_CLI_BIN", default_value = "claude")]
    cli_bin: PathBuf,
    /// Extra argument passed through to the agent CLI. Repeatable.
    #[arg(long = "cli-arg")]
    cli_args: Vec<String>,
    /// Initial permission mode: bypassPermissions, acceptEdits or default.
    #[arg(long, default_value_t = PermissionMode::AlwaysAllow)]
    permission_mode: PermissionMode,
    /// Tool auto-allowed in acceptEdits mode. Repeatable; replaces the built-in list.
    #[arg(long = "safe-tool")]
    safe_tools: Vec<String>,
    /// Append every outbound envelope to this JSONL file.
    #[arg(long)]
    transcript: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args = Args::parse();
    init_logging(args.log_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("failed to build tokio runtime: {err}"))?;
    runtime.block_on(serve(args))
}

fn init_logging(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

async fn serve(args: Args) -> Result<(), String> {
    tokio::fs::create_dir_all(&args.workspace)
        .await
        .map_err(|err| format!("failed to create workspace {}: {err}", args.workspace.display()))?;

    let engine = ProcessEngine::new(
        ProcessEngineConfig::new(&args.cli_bin).with_extra_args(args.cli_args.iter().cloned()),
    )
    .map_err(|err| err.to_string())?;

    let mut session_config =
        SessionConfig::new(&args.workspace).with_permission_mode(args.permission_mode);
    if !args.safe_tools.is_empty() {
        session_config = session_config.with_safe_tools(args.safe_tools.iter().cloned());
    }

    let mut web_config = WebConfig::default();
    if let Some(path) = &args.transcript {
        web_config = web_config.with_transcript_path(path);
    }

    let server = ConversationServer::new(Arc::new(engine), session_config, web_config)
        .await
        .map_err(|err| err.to_string())?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|err| format!("invalid listen address {}:{}: {err}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| format!("failed to bind {addr}: {err}"))?;
    tracing::info!(
        %addr,
        path = CONVERSATION_PATH,
        workspace = %args.workspace.display(),
        mode = %args.permission_mode,
        "conversation server listening"
    );

    axum::serve(listener, server.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| format!("server failed: {err}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
