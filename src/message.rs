//! Message Codec — parses and serializes PostgreSQL v3 wire messages.
//!
//! See <http://developer.postgresql.org/pgdocs/postgres/protocol-message-formats.html>.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProxyError, Result};

const SSL_REQUEST_CODE: u32 = 0x8087_7103;
const CANCEL_REQUEST_CODE: u32 = 0x8087_7102;

/// Transaction status reported by a backend `ReadyForQuery` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    Failed,
    Transaction,
}

impl TxStatus {
    fn wire_byte(self) -> u8 {
        match self {
            TxStatus::Idle => b'I',
            TxStatus::Failed => b'E',
            TxStatus::Transaction => b'T',
        }
    }

    fn from_wire_byte(b: u8) -> Option<TxStatus> {
        match b {
            b'I' => Some(TxStatus::Idle),
            b'E' => Some(TxStatus::Failed),
            b'T' => Some(TxStatus::Transaction),
            _ => None,
        }
    }
}

/// One field of an `ErrorResponse`: a single-byte tag plus its string value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorField {
    pub tag: u8,
    pub value: String,
}

impl ErrorField {
    pub fn new(tag: u8, value: impl Into<String>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }
}

/// A single parsed PostgreSQL v3 frontend or backend message.
///
/// Every variant carries `raw`, the exact wire bytes that produced it, so
/// `serialize()` always round-trips.
#[derive(Clone, Debug)]
pub enum Message {
    Query {
        sql: String,
        raw: Bytes,
    },
    /// `R` — authentication request/response.
    AuthenticationRequest {
        sub_kind: u32,
        success: bool,
        raw: Bytes,
    },
    ReadyForQuery {
        status: TxStatus,
        raw: Bytes,
    },
    ParameterStatus {
        name: String,
        value: String,
        raw: Bytes,
    },
    ErrorResponse {
        fields: Vec<ErrorField>,
        raw: Bytes,
    },
    CommandComplete {
        tag: String,
        raw: Bytes,
    },
    Startup {
        parameters: HashMap<String, String>,
        raw: Bytes,
    },
    Cancel {
        pid: u32,
        secret: u32,
        raw: Bytes,
    },
    SslRequest {
        raw: Bytes,
    },
    Terminate {
        raw: Bytes,
    },
    /// Any message type this proxy does not need to inspect. Passed through
    /// unmolested; `type_byte` preserves the wire type code.
    Other {
        type_byte: u8,
        raw: Bytes,
    },
}

impl Message {
    /// The wire type byte, or `None` for the typeless startup-era messages.
    pub fn type_byte(&self) -> Option<u8> {
        match self {
            Message::Query { .. } => Some(b'Q'),
            Message::AuthenticationRequest { .. } => Some(b'R'),
            Message::ReadyForQuery { .. } => Some(b'Z'),
            Message::ParameterStatus { .. } => Some(b'S'),
            Message::ErrorResponse { .. } => Some(b'E'),
            Message::CommandComplete { .. } => Some(b'C'),
            Message::Terminate { .. } => Some(b'X'),
            Message::Other { type_byte, .. } => Some(*type_byte),
            Message::Startup { .. } | Message::Cancel { .. } | Message::SslRequest { .. } => None,
        }
    }

    pub fn raw(&self) -> &Bytes {
        match self {
            Message::Query { raw, .. }
            | Message::AuthenticationRequest { raw, .. }
            | Message::ReadyForQuery { raw, .. }
            | Message::ParameterStatus { raw, .. }
            | Message::ErrorResponse { raw, .. }
            | Message::CommandComplete { raw, .. }
            | Message::Startup { raw, .. }
            | Message::Cancel { raw, .. }
            | Message::SslRequest { raw, .. }
            | Message::Terminate { raw, .. }
            | Message::Other { raw, .. } => raw,
        }
    }

    /// Returns the exact wire bytes that should be written for this message.
    pub fn serialize(&self) -> Bytes {
        self.raw().clone()
    }
}

/// Describes how much of the buffer a would-be header claims, before the
/// body is necessarily available.
pub(crate) enum HeaderKind {
    Ordinary { type_byte: u8, total_length: usize },
    Typeless { total_length: usize, code: u32 },
}

/// Attempts to read a message header out of `buf`. Returns `None` if not
/// enough bytes are buffered yet.
///
/// Ordinary messages need 5 bytes (1 type + 4 length). Typeless messages
/// need 8: the always-zero high bytes of the 4-byte length field, the
/// low 16 bits of that length, and the 4-byte startup/cancel/ssl code.
pub(crate) fn peek_header(buf: &[u8]) -> Option<HeaderKind> {
    if buf.is_empty() {
        return None;
    }
    if buf[0] != 0 {
        if buf.len() < 5 {
            return None;
        }
        let n = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        Some(HeaderKind::Ordinary {
            type_byte: buf[0],
            total_length: n + 1,
        })
    } else {
        if buf.len() < 8 {
            return None;
        }
        let total_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some(HeaderKind::Typeless { total_length, code })
    }
}

/// Parses a complete message (exactly `total_length` bytes, as determined
/// by `peek_header`) into its typed representation.
pub fn parse_complete(raw: Bytes) -> Result<Message> {
    if raw.is_empty() {
        return Err(ProxyError::UnknownMessage("empty message".into()));
    }

    if raw[0] != 0 {
        let type_byte = raw[0];
        let payload = raw.slice(5..raw.len());
        parse_ordinary_body(type_byte, payload, raw)
    } else {
        let code = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        parse_typeless_body(code, raw)
    }
}

fn parse_ordinary_body(type_byte: u8, payload: Bytes, raw: Bytes) -> Result<Message> {
    let msg = match type_byte {
        b'Q' => Message::Query {
            sql: extract_cstring(&payload),
            raw,
        },
        b'R' => {
            let sub_kind = if payload.len() >= 4 {
                u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
            } else {
                0
            };
            Message::AuthenticationRequest {
                sub_kind,
                success: sub_kind == 0,
                raw,
            }
        }
        b'Z' => {
            let status = payload
                .first()
                .copied()
                .and_then(TxStatus::from_wire_byte)
                .unwrap_or(TxStatus::Idle);
            Message::ReadyForQuery { status, raw }
        }
        b'S' => {
            let mut parts = split_cstrings(&payload).into_iter();
            let name = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            Message::ParameterStatus { name, value, raw }
        }
        b'C' => Message::CommandComplete {
            tag: extract_cstring(&payload),
            raw,
        },
        b'X' => Message::Terminate { raw },
        b'E' => Message::ErrorResponse {
            fields: parse_error_fields(&payload),
            raw,
        },
        other => Message::Other {
            type_byte: other,
            raw,
        },
    };
    Ok(msg)
}

fn parse_typeless_body(code: u32, raw: Bytes) -> Result<Message> {
    match code {
        SSL_REQUEST_CODE => Ok(Message::SslRequest { raw }),
        CANCEL_REQUEST_CODE => {
            if raw.len() < 16 {
                return Err(ProxyError::UnknownMessage(
                    "truncated CancelRequest".into(),
                ));
            }
            let pid = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
            let secret = u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]);
            Ok(Message::Cancel { pid, secret, raw })
        }
        version if is_supported_startup_version(version) => {
            let params_region = raw.slice(8..raw.len());
            let parameters = parse_startup_params(&params_region);
            Ok(Message::Startup { parameters, raw })
        }
        other => Err(ProxyError::UnknownMessage(format!(
            "unrecognized startup code 0x{other:08x}"
        ))),
    }
}

/// Accepted iff major == 3 and minor < 2.
fn is_supported_startup_version(code: u32) -> bool {
    (code >> 16) == 3 && (code & 0xffff) < 2
}

fn parse_startup_params(buf: &[u8]) -> HashMap<String, String> {
    let parts = split_cstrings(buf);
    let mut map = HashMap::new();
    let mut it = parts.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        map.insert(k, v);
    }
    map
}

fn extract_cstring(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Splits a buffer on NUL bytes, dropping empty trailing runs (mirrors the
/// source's `parseDict`: `[x for x in data.split('\x00') if x]`).
fn split_cstrings(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Parses `ErrorResponse` fields: the first byte of the payload is read and
/// discarded as a leading code byte, then the remaining bytes are split on
/// NUL, and each non-empty run's first byte is taken as the field tag. This
/// is lossy on the first field's tag (it loses one character to the
/// discarded byte) but matches every later field exactly, since those are
/// delimited by NUL rather than by fixed offsets.
fn parse_error_fields(payload: &[u8]) -> Vec<ErrorField> {
    if payload.is_empty() {
        return Vec::new();
    }
    let rest = &payload[1..];
    split_cstrings(rest)
        .into_iter()
        .filter_map(|run| {
            let mut chars = run.char_indices();
            let (_, first) = chars.next()?;
            let tag = first as u8;
            let value_start = first.len_utf8();
            Some(ErrorField::new(tag, run[value_start..].to_string()))
        })
        .collect()
}

// --- Synthetic constructors -------------------------------------------------

fn ordinary_header(type_byte: u8, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + payload_len);
    buf.put_u8(type_byte);
    buf.put_u32((payload_len + 4) as u32);
    buf
}

pub fn query(sql: &str) -> Message {
    let payload_len = sql.len() + 1;
    let mut buf = ordinary_header(b'Q', payload_len);
    buf.put_slice(sql.as_bytes());
    buf.put_u8(0);
    let raw = buf.freeze();
    Message::Query {
        sql: sql.to_string(),
        raw,
    }
}

pub fn authentication_ok() -> Message {
    let mut buf = ordinary_header(b'R', 4);
    buf.put_u32(0);
    Message::AuthenticationRequest {
        sub_kind: 0,
        success: true,
        raw: buf.freeze(),
    }
}

pub fn ready_for_query(status: TxStatus) -> Message {
    let mut buf = ordinary_header(b'Z', 1);
    buf.put_u8(status.wire_byte());
    Message::ReadyForQuery {
        status,
        raw: buf.freeze(),
    }
}

pub fn parameter_status(name: &str, value: &str) -> Message {
    let payload_len = name.len() + 1 + value.len() + 1;
    let mut buf = ordinary_header(b'S', payload_len);
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Message::ParameterStatus {
        name: name.to_string(),
        value: value.to_string(),
        raw: buf.freeze(),
    }
}

pub fn command_complete(tag: &str) -> Message {
    let payload_len = tag.len() + 1;
    let mut buf = ordinary_header(b'C', payload_len);
    buf.put_slice(tag.as_bytes());
    buf.put_u8(0);
    Message::CommandComplete {
        tag: tag.to_string(),
        raw: buf.freeze(),
    }
}

pub fn terminate() -> Message {
    let buf = ordinary_header(b'X', 0);
    Message::Terminate { raw: buf.freeze() }
}

pub fn error_response(fields: &[(u8, &str)]) -> Message {
    let payload_len = fields.iter().map(|(_, v)| 1 + v.len() + 1).sum::<usize>() + 1;
    let mut buf = ordinary_header(b'E', payload_len);
    for (tag, value) in fields {
        buf.put_u8(*tag);
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0);
    Message::ErrorResponse {
        fields: fields
            .iter()
            .map(|(t, v)| ErrorField::new(*t, *v))
            .collect(),
        raw: buf.freeze(),
    }
}
