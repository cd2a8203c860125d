use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshd::config::{load_stack, GatewayConfig};
use meshd::{rest, GatewayContext};
use tracing::info;

#[derive(Parser)]
#[command(name = "meshd", about = "MCP tool-mesh gateway daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP port for the JSON-RPC, SSE and REST surface
    #[arg(long, default_value_t = 8420, env = "MESHD_PORT")]
    port: u16,

    /// Stack file declaring southbound servers and agent bindings
    #[arg(long, default_value = "meshd.yaml", env = "MESHD_STACK")]
    stack: PathBuf,

    /// Data directory for the skill store
    #[arg(long, env = "MESHD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MESHD_LOG")]
    log: String,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway (default when no subcommand given)
    Serve,
    /// Validate the stack file and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    match args.command {
        Some(Command::Check) => {
            let stack = load_stack(&args.stack)?;
            info!(
                servers = stack.servers.len(),
                agents = stack.agents.len(),
                "stack file ok"
            );
            Ok(())
        }
        None | Some(Command::Serve) => run_server(args).await,
    }
}

async fn run_server(args: Args) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "meshd starting"
    );

    let config = GatewayConfig::new(args.port, args.data_dir, args.log);
    info!(data_dir = %config.data_dir.display(), "data directory");

    let stack = load_stack(&args.stack)?;
    info!(
        stack = %args.stack.display(),
        servers = stack.servers.len(),
        "stack loaded"
    );

    let ctx = GatewayContext::new(config);
    ctx.bootstrap(&stack).await;
    Arc::clone(&ctx.sessions).spawn_sweeper(
        ctx.config.session_sweep_interval,
        ctx.shutdown.child_token(),
    );

    let addr: SocketAddr = format!("127.0.0.1:{}", ctx.config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "gateway listening");

    let router = rest::build_router(Arc::clone(&ctx));
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received; closing southbound clients");
    ctx.close().await;
    info!("meshd stopped");
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
