//! gRPC server initialization and lifecycle management

use anyhow::{Context, Result};
use axum::Router;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::bridge::GrpcBridge;
use crate::backend::Connector;
use crate::config::BridgeConfig;
use crate::fastcgi::{BackendAddress, FastCgiConnector};
use crate::pool::{BackendPool, PoolStats};
use crate::translator::CallTranslator;

/// Stops a running [`BridgeServer`]: no new calls are accepted and in-flight
/// calls are allowed to drain
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Stopping gRPC bridge, draining in-flight calls");
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Listener plus the universal gRPC handler
pub struct BridgeServer<C: Connector> {
    listener: TcpListener,
    bridge: GrpcBridge<C>,
    stop: CancellationToken,
}

impl BridgeServer<FastCgiConnector> {
    /// Build the FastCGI pool and bind the listener described by `config`
    pub async fn from_config(config: &BridgeConfig) -> Result<Self> {
        let address: BackendAddress = config
            .backend_addr
            .parse()
            .context("Invalid FastCGI backend address")?;
        let connector = FastCgiConnector::new(
            address,
            Duration::from_millis(config.pool.connect_timeout_ms),
        );
        let pool = BackendPool::new(connector, config.pool.to_pool_config());
        let translator = CallTranslator::new(
            pool,
            config.entry_file.as_str(),
            config.default_host.as_str(),
        );

        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

        BridgeServer::bind(addr, translator, config.max_message_size())
            .await
            .context("Failed to bind gRPC listener")
    }
}

impl<C: Connector> BridgeServer<C> {
    pub async fn bind(
        addr: SocketAddr,
        translator: CallTranslator<C>,
        max_message_size: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            bridge: GrpcBridge::new(translator, max_message_size),
            stop: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    pub fn pool(&self) -> &BackendPool<C> {
        self.bridge.translator().pool()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool().stats()
    }

    /// Router handing every path to the bridge
    pub fn router(&self) -> Router {
        Router::new()
            .fallback_service(self.bridge.clone())
            .layer(TraceLayer::new_for_grpc())
    }

    /// Serve until [`StopHandle::stop`], then drain and close the pool
    pub async fn serve(self) -> io::Result<()> {
        let app = self.router();
        let pool = self.pool().clone();
        let addr = self.listener.local_addr()?;

        tracing::info!(
            addr = %addr,
            backend = %pool.connector().endpoint(),
            entry_file = self.bridge.translator().entry_file(),
            "Starting gRPC bridge"
        );

        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(self.stop.cancelled_owned())
            .await;

        pool.close();
        tracing::info!("gRPC bridge stopped");
        result
    }
}
