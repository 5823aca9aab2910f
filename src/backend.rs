//! Backend request/response model and transport traits
//!
//! The pool and the translator only see these traits; the FastCGI client in
//! [`crate::fastcgi`] is the production implementation.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use std::sync::Arc;

use crate::error::BackendError;

/// HTTP-like envelope sent to the backend for one call
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    /// Fully qualified gRPC method, e.g. `/pkg.Service/Method`
    pub path: String,
    pub version: Version,
    pub host: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Script the backend should run for every request
    pub entry_file: Arc<str>,
}

impl BackendRequest {
    /// POST over HTTP/1.1, as every bridged call is
    pub fn post(
        path: impl Into<String>,
        host: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        entry_file: Arc<str>,
    ) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            version: Version::HTTP_11,
            host: host.into(),
            headers,
            body,
            entry_file,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Body as text, for error details
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A live session with the backend, used by one caller at a time
#[async_trait]
pub trait BackendConnection: Send + 'static {
    async fn round_trip(&mut self, request: &BackendRequest)
    -> Result<BackendResponse, BackendError>;

    /// Whether the connection can serve another request
    fn is_reusable(&self) -> bool {
        true
    }
}

/// Creates connections to a fixed backend endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BackendConnection;

    async fn connect(&self) -> Result<Self::Connection, BackendError>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}
