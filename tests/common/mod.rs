//! Shared fixtures: an in-memory backend and an in-process bridge

#![allow(dead_code)]

use async_trait::async_trait;
use grpc_fastcgi_bridge::{
    BackendConnection, BackendError, BackendPool, BackendRequest, BackendResponse, BridgeServer,
    CallTranslator, Connector, PoolConfig, StopHandle,
};
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tonic::transport::Channel;

pub const ENTRY_FILE: &str = "/srv/app/grpc.php";

type Handler = dyn Fn(&BackendRequest) -> Result<BackendResponse, BackendError> + Send + Sync;

/// Backend that answers every request with a closure and records what it saw
#[derive(Clone)]
pub struct MemoryBackend {
    handler: Arc<Handler>,
    delay: Duration,
    seen: Arc<Mutex<Vec<BackendRequest>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new(
        handler: impl Fn(&BackendRequest) -> Result<BackendResponse, BackendError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            delay: Duration::ZERO,
            seen: Arc::default(),
            active: Arc::default(),
            max_active: Arc::default(),
        }
    }

    /// 200 with the request body sent straight back
    pub fn echo() -> Self {
        Self::new(|req| {
            let mut resp = BackendResponse::new(StatusCode::OK, req.body.clone());
            resp.headers
                .insert("x-backend", http::HeaderValue::from_static("memory"));
            Ok(resp)
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// Highest number of round trips seen running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

pub struct MemoryConnection(MemoryBackend);

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn round_trip(
        &mut self,
        request: &BackendRequest,
    ) -> Result<BackendResponse, BackendError> {
        let backend = &self.0;
        let now = backend.active.fetch_add(1, Ordering::SeqCst) + 1;
        backend.max_active.fetch_max(now, Ordering::SeqCst);
        backend.seen.lock().unwrap().push(request.clone());

        if !backend.delay.is_zero() {
            tokio::time::sleep(backend.delay).await;
        }
        let result = (backend.handler)(request);
        backend.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, BackendError> {
        Ok(MemoryConnection(self.clone()))
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

/// Bridge serving on an ephemeral port
pub struct TestBridge<C: Connector> {
    pub addr: SocketAddr,
    pub pool: BackendPool<C>,
    stop: StopHandle,
    handle: JoinHandle<std::io::Result<()>>,
}

impl<C: Connector> TestBridge<C> {
    pub async fn start(connector: C, max_connections: usize) -> Self {
        let pool = BackendPool::new(
            connector,
            PoolConfig {
                max_connections,
                acquire_timeout: Duration::from_secs(2),
                idle_timeout: None,
            },
        );
        let translator = CallTranslator::new(pool.clone(), ENTRY_FILE, "localhost");
        let server = BridgeServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            translator,
            4 * 1024 * 1024,
        )
        .await
        .expect("bind");
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let handle = tokio::spawn(server.serve());

        Self {
            addr,
            pool,
            stop,
            handle,
        }
    }

    pub async fn channel(&self) -> Channel {
        Channel::from_shared(format!("http://{}", self.addr))
            .unwrap()
            .connect()
            .await
            .expect("connect to bridge")
    }

    pub async fn shutdown(self) {
        self.stop.stop();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("bridge did not drain")
            .unwrap()
            .unwrap();
    }
}
