//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::pool::PoolConfig;

/// Main bridge configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen_addr: String,
    /// `host:port`, or `unix:/path/to.sock`
    pub backend_addr: String,
    /// Script every call is routed to (`SCRIPT_FILENAME`)
    pub entry_file: String,
    /// Host used when a call carries no `:authority`
    pub default_host: String,
    pub max_message_size_mb: usize,
    pub graceful_shutdown_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,
    pub pool: PoolSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backend_addr: default_backend_addr(),
            entry_file: String::new(),
            default_host: default_host(),
            max_message_size_mb: default_max_message_size_mb(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout(),
            metrics_addr: None,
            pool: PoolSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(addr) = std::env::var("GRPC_FASTCGI_ADDRESS") {
            config.listen_addr = addr;
        }
        if let Ok(backend) = std::env::var("GRPC_FASTCGI_BACKEND") {
            config.backend_addr = backend;
        }
        if let Ok(entry_file) = std::env::var("GRPC_FASTCGI_ENTRY_FILE") {
            config.entry_file = entry_file;
        }
        if let Ok(size) = std::env::var("GRPC_FASTCGI_POOL_SIZE") {
            config.pool.max_connections = size
                .parse()
                .context("Invalid GRPC_FASTCGI_POOL_SIZE value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.entry_file.trim().is_empty() {
            anyhow::bail!("An entry file is required");
        }
        if self.listen_addr.is_empty() {
            anyhow::bail!("Listen address cannot be empty");
        }
        if self.backend_addr.is_empty() {
            anyhow::bail!("FastCGI backend address cannot be empty");
        }
        if self.max_message_size_mb == 0 {
            anyhow::bail!("max_message_size_mb must be > 0");
        }
        if let Some(metrics_addr) = &self.metrics_addr
            && metrics_addr == &self.listen_addr
        {
            anyhow::bail!(
                "Metrics address {} conflicts with the gRPC listen address",
                metrics_addr
            );
        }

        self.pool.validate()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

/// Backend connection pool settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Idle connections older than this are closed instead of reused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_secs: None,
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("pool.max_connections must be > 0");
        }
        if self.acquire_timeout_ms == 0 {
            anyhow::bail!("pool.acquire_timeout_ms must be > 0");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("pool.connect_timeout_ms must be > 0");
        }
        if self.idle_timeout_secs == Some(0) {
            anyhow::bail!("pool.idle_timeout_secs must be > 0 when set");
        }
        Ok(())
    }

    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

// Default functions
fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_backend_addr() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_max_message_size_mb() -> usize {
    4
}
fn default_graceful_shutdown_timeout() -> u64 {
    30
}
fn default_max_connections() -> usize {
    16
}
fn default_acquire_timeout_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
