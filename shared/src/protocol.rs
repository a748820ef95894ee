//! Binary protocol types for rtunnel communication.
//!
//! Every WebSocket binary frame carries exactly one [`Command`]:
//!
//! ```text
//! [kind: i32 LE][correlation id: 16 bytes][payload length: varint][payload: UTF-8]
//! ```
//!
//! The correlation id uses the mixed-endian GUID byte order and the payload
//! length is a 7-bit variable-length integer (low groups first, high bit set
//! on every byte but the last).

use std::collections::HashMap;

use bytes::{Buf, BufMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest WebSocket frame on a tunnel: a base64 body of
/// [`MAX_MESSAGE_SIZE`] bytes plus 1 MB for the JSON envelope and headers.
pub const MAX_FRAME_SIZE: usize = (MAX_MESSAGE_SIZE + 2) / 3 * 4 + 1024 * 1024;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_ENCODING: &str = "Content-Encoding";

/// Fixed header: kind + correlation id.
const HEADER_LEN: usize = 4 + 16;

/// A non-negative i32 never needs more than five 7-bit groups.
const MAX_VARINT_GROUPS: usize = 5;

/// Command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CommandKind {
    /// Free text, logged by the receiver
    Echo = 1,
    /// JSON [`HttpRequestData`], host to client
    HttpRequest = 2,
    /// JSON [`HttpResponseData`], client to host
    HttpResponse = 3,
    /// JSON [`TunnelInfo`], host to client after registration
    TunnelInfo = 4,
}

impl CommandKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(CommandKind::Echo),
            2 => Some(CommandKind::HttpRequest),
            3 => Some(CommandKind::HttpResponse),
            4 => Some(CommandKind::TunnelInfo),
            _ => None,
        }
    }
}

/// The only unit ever sent over a tunnel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub correlation_id: Uuid,
    pub payload: String,
}

impl Command {
    /// New command with a fresh correlation id.
    pub fn new(kind: CommandKind, payload: impl Into<String>) -> Self {
        Self::reply(kind, Uuid::new_v4(), payload)
    }

    /// Command answering an earlier one; keeps its correlation id.
    pub fn reply(kind: CommandKind, correlation_id: Uuid, payload: impl Into<String>) -> Self {
        Self {
            kind,
            correlation_id,
            payload: payload.into(),
        }
    }

    pub fn echo(text: impl Into<String>) -> Self {
        Self::new(CommandKind::Echo, text)
    }

    pub fn json<T: Serialize>(kind: CommandKind, value: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_string(value)?))
    }

    pub fn json_reply<T: Serialize>(
        kind: CommandKind,
        correlation_id: Uuid,
        value: &T,
    ) -> Result<Self> {
        Ok(Self::reply(kind, correlation_id, serde_json::to_string(value)?))
    }

    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload.as_bytes();
        let mut buf = Vec::with_capacity(HEADER_LEN + MAX_VARINT_GROUPS + payload.len());
        buf.put_i32_le(self.kind.code());
        buf.put_slice(&self.correlation_id.to_bytes_le());
        write_varint(&mut buf, payload.len() as u32);
        buf.put_slice(payload);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::format(format!(
                "frame too short: {} bytes",
                buf.remaining()
            )));
        }

        let code = buf.get_i32_le();
        let kind = CommandKind::from_code(code)
            .ok_or_else(|| Error::format(format!("unknown command kind {}", code)))?;

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let correlation_id = Uuid::from_bytes_le(id);

        let len = read_varint(&mut buf)?;
        if buf.remaining() < len {
            return Err(Error::format(format!(
                "payload truncated: declared {} bytes, {} available",
                len,
                buf.remaining()
            )));
        }

        let payload = std::str::from_utf8(&buf[..len])
            .map_err(|e| Error::format(format!("payload is not UTF-8: {}", e)))?
            .to_owned();
        buf.advance(len);

        if buf.has_remaining() {
            return Err(Error::format(format!(
                "{} trailing bytes after payload",
                buf.remaining()
            )));
        }

        Ok(Self {
            kind,
            correlation_id,
            payload,
        })
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn read_varint(buf: &mut &[u8]) -> Result<usize> {
    let mut value: u32 = 0;
    for group in 0..MAX_VARINT_GROUPS {
        if !buf.has_remaining() {
            return Err(Error::format("truncated payload length"));
        }
        let byte = buf.get_u8();
        // last group holds bits 28..31; bit 31 would make the length negative
        if group == MAX_VARINT_GROUPS - 1 && byte > 0x07 {
            return Err(Error::format("payload length out of range"));
        }
        value |= u32::from(byte & 0x7F) << (7 * group);
        if byte & 0x80 == 0 {
            return Ok(value as usize);
        }
    }
    Err(Error::format("payload length uses too many bytes"))
}

/// HTTP request forwarded through the tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestData {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_content")]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub content_headers: HashMap<String, String>,
}

/// Response produced by the local service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseData {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_content")]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub content_headers: HashMap<String, String>,
}

impl HttpResponseData {
    pub fn content_header(&self, name: &str) -> Option<&str> {
        find_header(&self.content_headers, name)
    }

    /// Replaces any existing entry regardless of its case.
    pub fn set_content_header(&mut self, name: &str, value: impl Into<String>) {
        self.content_headers
            .retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.content_headers.insert(name.to_string(), value.into());
    }
}

/// Sent to a client once its public name is assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub url: String,
}

/// Case-insensitive header lookup.
pub fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// `x-forwarded-host` → `X-Forwarded-Host`
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

mod base64_content {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
