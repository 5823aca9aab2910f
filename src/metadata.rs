//! Call metadata and its mapping to and from backend headers

use http::Uri;
use http::header::{HOST, HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};

/// Pseudo-header carrying the virtual host of the call
pub const AUTHORITY: &str = ":authority";

/// Transport-level headers that never reach the backend
const RESERVED_HEADERS: &[&str] = &[
    "te",
    "host",
    "content-length",
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-message-type",
    "grpc-status",
    "grpc-message",
    "grpc-status-details-bin",
];

/// Backend response headers that HTTP/2 forbids or that describe the
/// backend's own framing
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "content-length",
];

/// Ordered multi-valued metadata with case-insensitive keys
///
/// Keys are stored lower-cased in first-insertion order; values of a key keep
/// the order they were added in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Vec<String>)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, keeping any existing values for the key
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        let key = key.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value.into()),
            None => self.entries.push((key, vec![value.into()])),
        }
    }

    /// All values for a key, in order
    pub fn get_all(&self, key: &str) -> &[String] {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, values)| (k.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the inbound view of a call from its HTTP/2 request head
    ///
    /// `:authority` comes from the URI, or the `Host` header when the URI has
    /// none. Reserved transport headers are left out; `content-type` and
    /// `user-agent` are kept.
    pub fn from_request_parts(uri: &Uri, headers: &HeaderMap) -> Self {
        let mut metadata = Metadata::new();

        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                headers
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
        if let Some(authority) = authority {
            metadata.append(AUTHORITY, authority);
        }

        for (name, value) in headers {
            if RESERVED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            match value.to_str() {
                Ok(value) => metadata.append(name.as_str(), value),
                Err(_) => {
                    tracing::debug!(header = %name, "Skipping non-ASCII metadata value");
                }
            }
        }

        metadata
    }

    /// Call deadline requested through `grpc-timeout`, if any
    pub fn timeout_from_headers(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get("grpc-timeout")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
    }
}

/// Headers for the backend request synthesized from inbound metadata
///
/// Returns the selected host and the header map. The first `:authority` value
/// picks the host (`default_host` when missing or empty) and is not copied as
/// a header; every other entry is appended as-is, repeated keys staying
/// repeated.
pub fn remap_request_headers(metadata: &Metadata, default_host: &str) -> (String, HeaderMap) {
    let mut host = default_host.to_string();
    let mut headers = HeaderMap::new();

    for (key, values) in metadata.iter() {
        if key == AUTHORITY {
            if let Some(first) = values.first().filter(|v| !v.is_empty()) {
                host = first.clone();
            }
            continue;
        }

        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            tracing::debug!(key, "Skipping metadata key that is not a header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => tracing::debug!(key, "Skipping invalid header value"),
            }
        }
    }

    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(HOST, value);
    }

    (host, headers)
}

/// Response metadata built from backend response headers
///
/// Keys are lower-cased (HeaderMap already stores them that way) and every
/// value is kept. Hop-by-hop headers and headers that cannot be gRPC
/// metadata are dropped.
pub fn response_metadata(headers: &HeaderMap) -> MetadataMap {
    let mut metadata = MetadataMap::new();

    for (name, value) in headers {
        let key = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&key.as_str()) {
            continue;
        }
        if key.ends_with("-bin") {
            tracing::debug!(key, "Skipping binary response header");
            continue;
        }
        let Ok(key) = MetadataKey::<Ascii>::from_bytes(key.as_bytes()) else {
            continue;
        };
        let Ok(value) = value.to_str() else {
            continue;
        };
        if let Ok(value) = MetadataValue::<Ascii>::try_from(value) {
            metadata.append(key, value);
        }
    }

    metadata
}

/// Parse a `grpc-timeout` header value such as `150m` or `2S`
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let duration = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}
