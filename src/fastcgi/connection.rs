//! FastCGI connection to a process manager (php-fpm and friends)

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use super::record::{
    FLAG_KEEP_CONN, HEADER_LEN, ProtocolStatus, ROLE_RESPONDER, RecordHeader, RecordType,
    parse_end_request, write_begin_request, write_param, write_stream,
};
use super::response::parse_cgi_response;
use crate::backend::{BackendConnection, BackendRequest, BackendResponse, Connector};
use crate::error::BackendError;

/// Only one request is ever in flight on a connection
const REQUEST_ID: u16 = 1;

const SERVER_SOFTWARE: &str = concat!("grpc-fastcgi-bridge/", env!("CARGO_PKG_VERSION"));

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// Where the FastCGI backend listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddress {
    Tcp(String),
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

impl FromStr for BackendAddress {
    type Err = BackendError;

    /// `host:port`, or `unix:/path/to/socket`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            #[cfg(unix)]
            return Ok(BackendAddress::Unix(path.into()));
            #[cfg(not(unix))]
            return Err(BackendError::Protocol(format!(
                "unix sockets are not supported here: {}",
                path
            )));
        }
        if s.is_empty() {
            return Err(BackendError::Protocol("empty backend address".to_string()));
        }
        Ok(BackendAddress::Tcp(s.to_string()))
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddress::Tcp(addr) => write!(f, "{}", addr),
            #[cfg(unix)]
            BackendAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Opens FastCGI connections to one backend
#[derive(Debug, Clone)]
pub struct FastCgiConnector {
    address: BackendAddress,
    connect_timeout: Duration,
}

impl FastCgiConnector {
    pub fn new(address: BackendAddress, connect_timeout: Duration) -> Self {
        Self {
            address,
            connect_timeout,
        }
    }

    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    async fn open(&self) -> io::Result<Box<dyn IoStream>> {
        match &self.address {
            BackendAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            BackendAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[async_trait]
impl Connector for FastCgiConnector {
    type Connection = FastCgiConnection;

    async fn connect(&self) -> Result<FastCgiConnection, BackendError> {
        let stream = tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| BackendError::ConnectTimeout(self.address.to_string()))??;

        Ok(FastCgiConnection {
            stream: BufStream::new(stream),
            reusable: true,
        })
    }

    fn endpoint(&self) -> String {
        self.address.to_string()
    }
}

/// One keep-alive FastCGI connection
pub struct FastCgiConnection {
    stream: BufStream<Box<dyn IoStream>>,
    reusable: bool,
}

impl FastCgiConnection {
    async fn send_request(&mut self, request: &BackendRequest) -> Result<(), BackendError> {
        let params = encode_params(request);

        let mut out = BytesMut::with_capacity(params.len() + request.body.len() + 64);
        write_begin_request(&mut out, REQUEST_ID, ROLE_RESPONDER, FLAG_KEEP_CONN);
        write_stream(&mut out, RecordType::Params, REQUEST_ID, &params);
        write_stream(&mut out, RecordType::Stdin, REQUEST_ID, &request.body);

        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read records until END_REQUEST, returning collected STDOUT
    async fn read_response(&mut self) -> Result<BytesMut, BackendError> {
        let mut stdout = BytesMut::new();

        loop {
            let mut raw = [0u8; HEADER_LEN];
            if let Err(e) = self.stream.read_exact(&mut raw).await {
                return Err(match e.kind() {
                    io::ErrorKind::UnexpectedEof => BackendError::Closed,
                    _ => BackendError::Io(e),
                });
            }
            let header = RecordHeader::decode(&raw)?;

            let mut content = vec![0u8; header.body_len()];
            self.stream.read_exact(&mut content).await?;
            content.truncate(header.content_length as usize);

            if header.request_id != REQUEST_ID {
                tracing::debug!(
                    request_id = header.request_id,
                    record_type = ?header.record_type,
                    "Ignoring record for another request"
                );
                continue;
            }

            match header.record_type {
                RecordType::Stdout => stdout.put_slice(&content),
                RecordType::Stderr => {
                    if !content.is_empty() {
                        tracing::warn!(
                            stderr = %String::from_utf8_lossy(&content),
                            "Backend wrote to stderr"
                        );
                    }
                }
                RecordType::EndRequest => {
                    let (app_status, protocol_status) = parse_end_request(&content)?;
                    if protocol_status != ProtocolStatus::RequestComplete {
                        return Err(BackendError::Rejected(protocol_status.describe()));
                    }
                    tracing::trace!(app_status, "Backend request complete");
                    return Ok(stdout);
                }
                other => {
                    tracing::debug!(record_type = ?other, "Ignoring unexpected record");
                }
            }
        }
    }
}

#[async_trait]
impl BackendConnection for FastCgiConnection {
    async fn round_trip(
        &mut self,
        request: &BackendRequest,
    ) -> Result<BackendResponse, BackendError> {
        if !self.reusable {
            return Err(BackendError::Closed);
        }
        // Only a clean END_REQUEST leaves the stream in a known state
        self.reusable = false;

        self.send_request(request).await?;
        let stdout = self.read_response().await?;
        self.reusable = true;

        parse_cgi_response(stdout.freeze())
    }

    fn is_reusable(&self) -> bool {
        self.reusable
    }
}

/// CGI/1.1 environment for a bridged request
fn encode_params(request: &BackendRequest) -> BytesMut {
    let (server_name, server_port) = match request.host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) && !port.is_empty() => {
            (name, port)
        }
        _ => (request.host.as_str(), "80"),
    };
    let script_name = request
        .entry_file
        .rsplit('/')
        .next()
        .map(|name| format!("/{}", name))
        .unwrap_or_default();
    let content_type = request
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/grpc");
    let content_length = request.body.len().to_string();

    let mut params = BytesMut::new();
    let fixed: [(&str, &str); 15] = [
        ("GATEWAY_INTERFACE", "CGI/1.1"),
        ("SERVER_SOFTWARE", SERVER_SOFTWARE),
        ("SERVER_PROTOCOL", version_str(request.version)),
        ("SERVER_NAME", server_name),
        ("SERVER_PORT", server_port),
        ("REQUEST_METHOD", request.method.as_str()),
        ("SCRIPT_FILENAME", &request.entry_file),
        ("SCRIPT_NAME", &script_name),
        ("REQUEST_URI", &request.path),
        ("DOCUMENT_URI", &request.path),
        ("PATH_INFO", &request.path),
        ("QUERY_STRING", ""),
        ("CONTENT_TYPE", content_type),
        ("CONTENT_LENGTH", &content_length),
        ("HTTP_HOST", &request.host),
    ];
    for (name, value) in fixed {
        write_param(&mut params, name.as_bytes(), value.as_bytes());
    }

    for name in request.headers.keys() {
        // `proxy` would become HTTP_PROXY (httpoxy)
        if matches!(
            name.as_str(),
            "host" | "content-type" | "content-length" | "proxy"
        ) {
            continue;
        }
        let joined = request
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        let cgi_name = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        write_param(&mut params, cgi_name.as_bytes(), joined.as_bytes());
    }

    params
}

fn version_str(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    }
}
