//! FastCGI backend transport
//!
//! A small client for the responder role: one request at a time per
//! keep-alive connection, CGI response parsed into a [`BackendResponse`].
//!
//! [`BackendResponse`]: crate::backend::BackendResponse

pub mod connection;
pub mod record;
pub mod response;

pub use connection::{BackendAddress, FastCgiConnection, FastCgiConnector};
