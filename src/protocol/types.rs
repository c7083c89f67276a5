//! Envelope Data Types
//!
//! This module defines the values carried inside a message envelope and the
//! frames that wrap them on the wire. The format is line-oriented and
//! binary-safe: every frame starts with a type prefix byte and every header
//! line ends with CRLF.
//!
//! ## Protocol Format
//!
//! - `+` Text
//! - `-` Error (server to client only)
//! - `:` Integer
//! - `$` Blob (length-prefixed, binary safe)
//! - `*` List
//! - `%` Map (count of key/value pairs)
//! - `_` Null
//! - `&` Raw stream (server to client only, never wrapped in a map)
//!
//! ## Examples
//!
//! Text: `+alice\r\n`
//! Blob: `$5\r\nhello\r\n`
//! Map: `%1\r\n+command\r\n+PING\r\n`
//! Raw: `&4\r\n\xff\xd8\xff\xe0\r\n`

use bytes::Bytes;
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;

/// The CRLF terminator used by every header line
pub const CRLF: &[u8] = b"\r\n";

/// Frame type prefixes
pub mod prefix {
    pub const TEXT: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BLOB: u8 = b'$';
    pub const LIST: u8 = b'*';
    pub const MAP: u8 = b'%';
    pub const NULL: u8 = b'_';
    pub const RAW: u8 = b'&';
}

/// An ordered key/value payload.
pub type Payload = IndexMap<String, Value>;

/// A single value inside an envelope.
///
/// Handlers see request fields and session attributes as `Value`s; the
/// dispatcher never interprets them beyond the `command` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// UTF-8 text. Text holding CR or LF goes out as a blob.
    Text(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Binary-safe bytes, e.g. an uploaded file.
    Blob(Bytes),

    /// An ordered list of values, possibly nested.
    List(Vec<Value>),

    /// A nested ordered map.
    Map(Payload),

    /// Absent value.
    Null,
}

impl Value {
    /// Creates a text value.
    ///
    /// # Example
    /// ```
    /// use switchboard::protocol::Value;
    /// let name = Value::text("alice");
    /// assert_eq!(name.as_str(), Some("alice"));
    /// ```
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Creates a blob value.
    pub fn blob(data: impl Into<Bytes>) -> Self {
        Value::Blob(data.into())
    }

    /// Creates an empty map value.
    pub fn empty_map() -> Self {
        Value::Map(Payload::new())
    }

    /// Returns the string content of Text, or of a Blob holding valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Blob(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes of a Blob or Text.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns the integer, parsing Text if needed.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Payload> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns true if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Serializes the value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Text(s) => write_text(buf, s),
            Value::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Value::Blob(data) => write_sized(buf, prefix::BLOB, data),
            Value::List(items) => {
                write_header(buf, prefix::LIST, items.len());
                for item in items {
                    item.serialize_into(buf);
                }
            }
            Value::Map(map) => write_map(buf, map),
            Value::Null => {
                buf.push(prefix::NULL);
                buf.extend_from_slice(CRLF);
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Blob(b)
    }
}

impl From<Payload> for Value {
    fn from(map: Payload) -> Self {
        Value::Map(map)
    }
}

/// Journal records keep blobs out of the log: only their length is written.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Text(s) => serializer.serialize_str(s),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Blob(b) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("blob_len", &b.len())?;
                map.end()
            }
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(payload) => {
                let mut map = serializer.serialize_map(Some(payload.len()))?;
                for (k, v) in payload {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Null => serializer.serialize_none(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Blob(data) => write!(f, "(blob, {} bytes)", data.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Null => write!(f, "(nil)"),
        }
    }
}

/// A complete frame as it travels over the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A structured value. Requests and structured responses are maps.
    Value(Value),

    /// A decode or protocol error reported back to the peer.
    Error(String),

    /// A raw byte stream, e.g. file content, with no map wrapping.
    Raw(Bytes),
}

impl Frame {
    /// Creates a structured map frame.
    pub fn map(payload: Payload) -> Self {
        Frame::Value(Value::Map(payload))
    }

    /// Creates an error frame.
    pub fn error(msg: impl Into<String>) -> Self {
        Frame::Error(msg.into())
    }

    /// Serializes the frame to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the frame into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Value(value) => value.serialize_into(buf),
            Frame::Error(msg) => {
                buf.push(prefix::ERROR);
                // CR/LF would break the line framing.
                for b in msg.bytes() {
                    buf.push(if b == b'\r' || b == b'\n' { b' ' } else { b });
                }
                buf.extend_from_slice(CRLF);
            }
            Frame::Raw(data) => write_sized(buf, prefix::RAW, data),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns the map payload of a structured frame.
    pub fn as_map(&self) -> Option<&Payload> {
        match self {
            Frame::Value(Value::Map(map)) => Some(map),
            _ => None,
        }
    }
}

/// Writes the header line for a raw stream of `len` bytes. The caller is
/// responsible for the body and the trailing CRLF.
pub fn raw_header(len: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.push(prefix::RAW);
    buf.extend_from_slice(len.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf
}

fn write_header(buf: &mut Vec<u8>, tag: u8, count: usize) {
    buf.push(tag);
    buf.extend_from_slice(count.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

fn write_sized(buf: &mut Vec<u8>, tag: u8, data: &[u8]) {
    write_header(buf, tag, data.len());
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

fn write_map(buf: &mut Vec<u8>, map: &Payload) {
    write_header(buf, prefix::MAP, map.len());
    for (key, value) in map {
        write_text(buf, key);
        value.serialize_into(buf);
    }
}

fn write_text(buf: &mut Vec<u8>, s: &str) {
    if s.contains(['\r', '\n']) {
        write_sized(buf, prefix::BLOB, s.as_bytes());
        return;
    }
    buf.push(prefix::TEXT);
    buf.extend_from_slice(s.as_bytes());
    buf.extend_from_slice(CRLF);
}
