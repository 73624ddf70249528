//! mcp-switchboard binary: CLI parsing, logging, wiring, shutdown.

use anyhow::Context as _;
use clap::Parser;
use mcp_switchboard::config::CliArgs;
use mcp_switchboard::http::{create_router, AppState};
use mcp_switchboard::session::SessionManager;
use mcp_switchboard::upstream::{UpstreamFactory, UpstreamTarget};
use std::io::{stdout, IsTerminal as _};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period between the shutdown signal and connection teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting mcp-switchboard v{}", VERSION);

    let target = resolve_upstream_target(&args)?;
    tracing::info!(upstream = %target_summary(&target), server = ?args.server, "upstream configured");

    let http = reqwest::Client::new();
    let factory = UpstreamFactory::new(target, http.clone());
    let manager = SessionManager::new(Box::new(factory), args.settings());

    let (sse_endpoint, stream_endpoint) = args.endpoints();
    let state = Arc::new(AppState {
        manager: manager.clone(),
        sse_endpoint,
        stream_endpoint,
        dynamic_proxy: args.dynamic_proxy,
        enable_proxy: args.enable_proxy,
        http,
        start_time: Instant::now(),
        version: VERSION,
        max_body_bytes: args.max_body_bytes,
        total_requests: AtomicU64::new(0),
        failed_requests: AtomicU64::new(0),
    });

    let app = create_router(state.clone(), args.server);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid bind address '{}:{}'", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        addr = %addr,
        sse = %state.sse_endpoint,
        stream = %state.stream_endpoint,
        "listening"
    );

    let ct = CancellationToken::new();
    let ct_serve = ct.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                ct_serve.cancelled().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http server stopped with error");
        }
    });

    shutdown_signal().await;
    ct.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    manager.shutdown().await;
    let _ = server.await;

    tracing::info!("mcp-switchboard shut down gracefully");
    Ok(())
}

/// Pick the upstream target from the CLI surface. Dynamic mode wins; a
/// subprocess command beats a remote URL; configuring neither is a fatal
/// startup error.
fn resolve_upstream_target(args: &CliArgs) -> anyhow::Result<UpstreamTarget> {
    if args.dynamic_proxy {
        return Ok(UpstreamTarget::Dynamic);
    }
    if let Some(command) = &args.command {
        return Ok(UpstreamTarget::Stdio {
            command: command.clone(),
            args: args.args.clone(),
            env: args.env_map(),
            shell: args.shell,
        });
    }
    if let Some(url) = &args.upstream_url {
        return Ok(UpstreamTarget::Remote { url: url.clone() });
    }
    anyhow::bail!("no upstream configured: pass --command, --upstream-url, or --dynamic-proxy")
}

fn target_summary(target: &UpstreamTarget) -> String {
    match target {
        UpstreamTarget::Stdio { command, .. } => format!("stdio:{command}"),
        UpstreamTarget::Remote { url } => format!("remote:{url}"),
        UpstreamTarget::Dynamic => "dynamic".to_string(),
    }
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Human-readable format on a TTY, JSON otherwise.
    if stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
