//! gRPC FastCGI bridge - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use grpc_fastcgi_bridge::{BridgeServer, StopHandle, config::BridgeConfig, metrics};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "grpc-fastcgi-bridge")]
#[command(about = "Proxy gRPC calls to a FastCGI application", long_about = None)]
#[command(version)]
struct Cli {
    /// Script every call is routed to
    entry_file: Option<String>,

    /// Address to listen on for gRPC
    #[arg(short = 'a', long)]
    address: Option<String>,

    /// FastCGI backend address (host:port or unix:/path)
    #[arg(short = 'f', long)]
    fastcgi: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    // Load configuration
    let mut config = BridgeConfig::load(cli.config)?;

    // CLI overrides
    if let Some(entry_file) = cli.entry_file {
        config.entry_file = entry_file;
    }
    if let Some(address) = cli.address {
        config.listen_addr = address;
    }
    if let Some(fastcgi) = cli.fastcgi {
        config.backend_addr = fastcgi;
    }

    config.validate()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        backend_addr = %config.backend_addr,
        entry_file = %config.entry_file,
        pool_size = config.pool.max_connections,
        "Configuration loaded"
    );

    // Metrics listener runs until the bridge has drained
    let metrics_shutdown = CancellationToken::new();
    let metrics_handle = match &config.metrics_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("Invalid metrics address: {}", addr))?;
            let prometheus_handle = metrics::setup_metrics()?;
            let shutdown = metrics_shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = metrics::serve_metrics(addr, prometheus_handle, shutdown).await {
                    tracing::error!(error = %e, "Metrics server failed");
                }
            }))
        }
        None => None,
    };

    let server = BridgeServer::from_config(&config).await?;
    let stop = server.stop_handle();
    let mut serve = tokio::spawn(server.serve());

    tokio::select! {
        result = &mut serve => {
            result.context("gRPC server task failed")?.context("gRPC server error")?;
        }
        _ = shutdown_signal() => {
            drain(stop, serve, config.graceful_shutdown_timeout()).await?;
        }
    }

    metrics_shutdown.cancel();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

/// Stop accepting calls and wait for in-flight ones, up to `timeout`
async fn drain(
    stop: StopHandle,
    mut serve: tokio::task::JoinHandle<std::io::Result<()>>,
    timeout: std::time::Duration,
) -> Result<()> {
    stop.stop();
    match tokio::time::timeout(timeout, &mut serve).await {
        Ok(result) => {
            result.context("gRPC server task failed")?.context("gRPC server error")?;
        }
        Err(_) => {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Graceful shutdown timed out, aborting in-flight calls"
            );
            serve.abort();
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
