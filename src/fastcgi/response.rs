//! CGI response parsing
//!
//! A FastCGI responder writes a CGI response on STDOUT: a header block, a
//! blank line, then the body. The `Status` header carries the HTTP status.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use http::StatusCode;

use crate::backend::BackendResponse;
use crate::error::BackendError;

/// Split STDOUT into status, headers and body
pub fn parse_cgi_response(stdout: Bytes) -> Result<BackendResponse, BackendError> {
    let (head_len, body_start) = find_header_end(&stdout).ok_or_else(|| {
        BackendError::Protocol("response has no header terminator".to_string())
    })?;

    let head = std::str::from_utf8(&stdout[..head_len])
        .map_err(|_| BackendError::Protocol("response headers are not UTF-8".to_string()))?;

    let mut status = None;
    let mut headers = HeaderMap::new();

    for line in head.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            BackendError::Protocol(format!("malformed response header line: {:?}", line))
        })?;
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            status = Some(parse_status(value)?);
            continue;
        }

        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| BackendError::Protocol(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| BackendError::Protocol(format!("invalid value for header {}", name)))?;
        headers.append(name, value);
    }

    let status = status.unwrap_or_else(|| {
        if headers.contains_key(LOCATION) {
            StatusCode::FOUND
        } else {
            StatusCode::OK
        }
    });

    Ok(BackendResponse {
        status,
        headers,
        body: stdout.slice(body_start..),
    })
}

/// `Status: 404 Not Found` -> 404
fn parse_status(value: &str) -> Result<StatusCode, BackendError> {
    let code = value.split_whitespace().next().unwrap_or_default();
    code.parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| BackendError::Protocol(format!("invalid Status header {:?}", value)))
}

/// Length of the header block and offset of the body
///
/// Accepts `\r\n\r\n` and bare `\n\n` terminators. A response made only of
/// headers (no blank line) is treated as having an empty body.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
        if buf[i..].starts_with(b"\n\r\n") {
            return Some((i, i + 3));
        }
    }
    if buf.ends_with(b"\n") {
        return Some((buf.len(), buf.len()));
    }
    None
}
