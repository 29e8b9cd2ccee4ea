//! forward-proxy server binary.

use anyhow::{Context, Result};
use clap::Parser;
use forward_proxy::config::Config;
use forward_proxy::core::{Listener, Supervisor};
use forward_proxy::http::HttpHandler;
use forward_proxy::socks5::{Socks5Handler, StaticAuthenticator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Multi-protocol forwarding proxy: HTTP/HTTPS and SOCKS5 listeners
/// sharing one connection-lifecycle engine.
#[derive(Parser)]
#[command(name = "forward-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional HTTP/HTTPS proxy listen address (repeatable).
    #[arg(long = "http", value_name = "HOST:PORT")]
    http: Vec<String>,

    /// Additional SOCKS5 proxy listen address (repeatable).
    #[arg(long = "socks5", value_name = "HOST:PORT")]
    socks5: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.http_proxy_addrs.extend(cli.http);
    config.socks_proxy_addrs.extend(cli.socks5);

    info!("[Server] forward-proxy v{}", env!("CARGO_PKG_VERSION"));

    let supervisor = Arc::new(Supervisor::new());

    for addr in &config.http_proxy_addrs {
        let listener = Listener::new(addr.clone(), Arc::new(HttpHandler::new()));
        if let Err(err) = supervisor.add(listener).await {
            warn!("[Server] failed to start HTTP listener on {}: {}", addr, err);
        }
    }

    let authenticator = config
        .socks_credentials()
        .map(|(user, pass)| Arc::new(StaticAuthenticator::new(user, pass)) as Arc<_>);

    for addr in &config.socks_proxy_addrs {
        let handler = Socks5Handler::new(authenticator.clone());
        let listener = Listener::new(addr.clone(), Arc::new(handler));
        if let Err(err) = supervisor.add(listener).await {
            warn!("[Server] failed to start SOCKS5 listener on {}: {}", addr, err);
        }
    }

    if supervisor.is_empty().await {
        error!("[Server] no listener could be started, exiting");
        std::process::exit(1);
    }

    for (addr, kind) in supervisor.list().await {
        info!("[Server] {} listening on {}", kind, addr);
    }

    wait_for_shutdown_signal().await;
    info!("[Server] shutdown signal received, draining connections");

    let failures = supervisor.close_all().await;
    for (addr, err) in &failures {
        warn!("[Server] error closing listener {}: {}", addr, err);
    }

    info!("[Server] stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");
    let mut hangup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");

    tokio::select! {
        _ = term.recv() => info!("[Server] received SIGTERM"),
        _ = interrupt.recv() => info!("[Server] received SIGINT"),
        _ = quit.recv() => info!("[Server] received SIGQUIT"),
        _ = hangup.recv() => info!("[Server] received SIGHUP"),
    }
}

#[cfg(windows)]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::windows::ctrl_c()
        .expect("failed to register Ctrl+C handler")
        .recv()
        .await;
    info!("[Server] received Ctrl+C");
}
