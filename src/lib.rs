//! gRPC FastCGI bridge
//!
//! Accepts gRPC calls for any service and method, forwards the opaque request
//! message to a FastCGI application over a pool of keep-alive connections and
//! relays the backend's response as the gRPC response.

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod fastcgi;
pub mod grpc;
pub mod metadata;
pub mod metrics;
pub mod pool;
pub mod translator;

pub use backend::{BackendConnection, BackendRequest, BackendResponse, Connector};
pub use codec::{Fallback, Frame, FrameCodec, PassthroughCodec};
pub use config::{BridgeConfig, PoolSettings};
pub use error::{BackendError, CallError, PoolError};
pub use grpc::{BridgeServer, GrpcBridge, StopHandle};
pub use metadata::Metadata;
pub use pool::{BackendPool, PoolConfig, PoolStats, PooledConnection};
pub use translator::{CallContext, CallStream, CallTranslator};
