use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use capture_proxy::config::{self, ProxyConfig};
use capture_proxy::error::Result;
use capture_proxy::server::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "capture-proxy")]
#[command(about = "A local forward proxy that records every HTTP(S) exchange", long_about = None)]
struct Args {
    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Plain HTTP listener port (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// TLS listener port (0 picks a free port)
    #[arg(long)]
    tls_port: Option<u16>,

    /// Do not open the TLS listener
    #[arg(long)]
    no_tls: bool,

    /// Record request bodies of forwarded exchanges
    #[arg(long)]
    store_request_body: bool,

    /// Record response bodies of forwarded exchanges
    #[arg(long)]
    store_response_body: bool,

    /// Do not add the marker header to responses
    #[arg(long)]
    no_marker_header: bool,
}

impl Args {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.tls_port {
            config.tls.port = port;
        }
        if self.no_tls {
            config.tls.enabled = false;
        }
        if self.store_request_body {
            config.store_request_body = true;
        }
        if self.store_response_body {
            config.store_response_body = true;
        }
        if self.no_marker_header {
            config.inject_marker_header = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    match format!("capture_proxy={log_level}").parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => eprintln!("Ignoring log directive: {e}"),
    }
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path).await.inspect_err(|e| {
                error!(
                    "Failed to load configuration from {}: {}",
                    path.display(),
                    e
                );
            })?
        }
        None => config::load_from_env_or_file().await.inspect_err(|e| {
            error!("Failed to load configuration: {}", e);
        })?,
    };
    args.apply(&mut config);

    let server = ProxyServer::new(config)?;
    let context = server.start().await?;

    let info = context.runtime_info()?;
    info!("HTTP proxy listening on port {}", info.http_port);
    if let Some(port) = info.tls_port {
        info!("TLS proxy listening on port {}", port);
    }
    info!("Point clients at {}", context.http_proxy()?);

    shutdown_signal().await;

    info!("Shutting down capture proxy");
    let captured = context.events_captured()?;
    server.stop().await?;

    info!("{}", captured.summary());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
