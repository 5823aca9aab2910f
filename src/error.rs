//! Error types for the bridge
//!
//! Every failure is scoped to a single call: pool and backend errors are
//! folded into a [`CallError`], which is turned into the terminal gRPC status
//! for that call and never leaks into another one.

use std::io;
use thiserror::Error;
use tonic::Status;

/// Errors raised while lending out a backend connection
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available before the acquire timeout
    #[error("connection pool exhausted after waiting {waited_ms}ms")]
    Exhausted { waited_ms: u64 },

    /// A fresh connection to the backend could not be established
    #[error("backend unreachable: {0}")]
    Connect(#[source] BackendError),

    /// The pool has been closed during shutdown
    #[error("connection pool is closed")]
    Closed,
}

/// Errors raised by the backend transport
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend i/o error: {0}")]
    Io(#[from] io::Error),

    /// The backend sent bytes that are not valid for the protocol
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// The backend refused the request (FastCGI protocol status)
    #[error("backend rejected request: {0}")]
    Rejected(&'static str),

    #[error("backend closed the connection")]
    Closed,

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
}

/// Terminal outcome of a failed call
#[derive(Debug, Error)]
pub enum CallError {
    /// Missing or extra inbound message, or a broken inbound stream
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("fastcgi request failed: {0}")]
    Unavailable(#[from] PoolError),

    #[error("fastcgi request failed: {0}")]
    Backend(#[from] BackendError),

    /// Backend answered with a non-200 status; the body is the detail
    #[error("{body}")]
    BackendStatus { status: u16, body: String },

    /// Sending response metadata or the response message failed
    #[error("{0}")]
    Send(String),

    #[error("call cancelled by peer")]
    Cancelled,

    #[error("call deadline exceeded")]
    DeadlineExceeded,
}

impl CallError {
    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::ProtocolViolation(_) => "protocol_violation",
            CallError::Unavailable(_) => "unavailable",
            CallError::Backend(_) => "backend_error",
            CallError::BackendStatus { .. } => "backend_status",
            CallError::Send(_) => "send_failed",
            CallError::Cancelled => "cancelled",
            CallError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl From<CallError> for Status {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Cancelled => Status::cancelled(err.to_string()),
            CallError::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
            // TODO: translate backend HTTP status codes into gRPC codes once
            // clients need to tell "not found" from "internal"
            other => Status::internal(other.to_string()),
        }
    }
}
