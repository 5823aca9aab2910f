//! gRPC front end
//!
//! The bridge registers no services: every `/{service}/{method}` path is
//! served by [`GrpcBridge`], which hands the opaque request frame to the
//! call translator.

pub mod bridge;
pub mod server;

pub use bridge::GrpcBridge;
pub use server::{BridgeServer, StopHandle};
