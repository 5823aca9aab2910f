//! FastCGI record framing
//!
//! Every record is an 8-byte header followed by up to 65535 bytes of content
//! and up to 255 bytes of padding:
//!
//! ```text
//! version:u8 type:u8 request_id:u16 content_length:u16 padding_length:u8 reserved:u8
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BackendError;

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Keep the connection open after the request completes
pub const FLAG_KEEP_CONN: u8 = 1;
pub const ROLE_RESPONDER: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl TryFrom<u8> for RecordType {
    type Error = BackendError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => {
                return Err(BackendError::Protocol(format!(
                    "unknown record type {}",
                    other
                )));
            }
        })
    }
}

/// Protocol status carried by END_REQUEST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMpxConn,
    Overloaded,
    UnknownRole,
    Other(u8),
}

impl From<u8> for ProtocolStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ProtocolStatus::RequestComplete,
            1 => ProtocolStatus::CantMpxConn,
            2 => ProtocolStatus::Overloaded,
            3 => ProtocolStatus::UnknownRole,
            other => ProtocolStatus::Other(other),
        }
    }
}

impl ProtocolStatus {
    pub fn describe(self) -> &'static str {
        match self {
            ProtocolStatus::RequestComplete => "request complete",
            ProtocolStatus::CantMpxConn => "cannot multiplex connection",
            ProtocolStatus::Overloaded => "backend overloaded",
            ProtocolStatus::UnknownRole => "unknown role",
            ProtocolStatus::Other(_) => "unknown protocol status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, BackendError> {
        if buf[0] != VERSION_1 {
            return Err(BackendError::Protocol(format!(
                "unsupported FastCGI version {}",
                buf[0]
            )));
        }
        Ok(Self {
            record_type: RecordType::try_from(buf[1])?,
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    /// Content plus padding that follows the header
    pub fn body_len(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }
}

/// Append one record, padded to an 8-byte boundary
///
/// `content` must fit in a single record.
pub fn write_record(dst: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;

    dst.reserve(HEADER_LEN + content.len() + padding);
    dst.put_u8(VERSION_1);
    dst.put_u8(record_type as u8);
    dst.put_u16(request_id);
    dst.put_u16(content.len() as u16);
    dst.put_u8(padding as u8);
    dst.put_u8(0);
    dst.put_slice(content);
    dst.put_bytes(0, padding);
}

/// Append a stream (PARAMS, STDIN) split into records, then its empty
/// terminating record
pub fn write_stream(dst: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8]) {
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        write_record(dst, record_type, request_id, chunk);
    }
    write_record(dst, record_type, request_id, &[]);
}

pub fn write_begin_request(dst: &mut BytesMut, request_id: u16, role: u16, flags: u8) {
    let mut body = [0u8; 8];
    body[..2].copy_from_slice(&role.to_be_bytes());
    body[2] = flags;
    write_record(dst, RecordType::BeginRequest, request_id, &body);
}

/// END_REQUEST body: app status and protocol status
pub fn parse_end_request(content: &[u8]) -> Result<(u32, ProtocolStatus), BackendError> {
    if content.len() < 8 {
        return Err(BackendError::Protocol(format!(
            "END_REQUEST body too short ({} bytes)",
            content.len()
        )));
    }
    let mut buf = content;
    let app_status = buf.get_u32();
    let protocol_status = ProtocolStatus::from(buf.get_u8());
    Ok((app_status, protocol_status))
}

fn put_length(dst: &mut BytesMut, len: usize) {
    if len < 0x80 {
        dst.put_u8(len as u8);
    } else {
        dst.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Encode one name-value pair for PARAMS
pub fn write_param(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_length(dst, name.len());
    put_length(dst, value.len());
    dst.put_slice(name);
    dst.put_slice(value);
}

fn get_length(src: &mut Bytes) -> Result<usize, BackendError> {
    let truncated = || BackendError::Protocol("truncated name-value pair".to_string());
    let first = *src.first().ok_or_else(truncated)?;
    if first & 0x80 == 0 {
        src.advance(1);
        Ok(first as usize)
    } else {
        if src.len() < 4 {
            return Err(truncated());
        }
        Ok((src.get_u32() & 0x7fff_ffff) as usize)
    }
}

/// Decode name-value pairs (GET_VALUES_RESULT, PARAMS)
pub fn read_params(mut src: Bytes) -> Result<Vec<(Bytes, Bytes)>, BackendError> {
    let mut pairs = Vec::new();
    while src.has_remaining() {
        let name_len = get_length(&mut src)?;
        let value_len = get_length(&mut src)?;
        if src.len() < name_len + value_len {
            return Err(BackendError::Protocol(
                "name-value pair longer than record".to_string(),
            ));
        }
        let name = src.split_to(name_len);
        let value = src.split_to(value_len);
        pairs.push((name, value));
    }
    Ok(pairs)
}
