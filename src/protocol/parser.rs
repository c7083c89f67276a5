//! Incremental Envelope Parser
//!
//! This module implements the frame parser for incoming connection data.
//! It is incremental: a message may arrive split across many TCP reads, or
//! several messages may arrive in one read.
//!
//! ## How the Parser Works
//!
//! The parser reads from a buffer and returns either:
//! - `Ok(Some((frame, consumed)))` - Successfully parsed a frame, `consumed` bytes were used
//! - `Ok(None)` - Need more data, the message is incomplete
//! - `Err(ParseError)` - Invalid framing
//!
//! The caller appends network data to a buffer, calls `parse()`, and on
//! success advances the buffer by `consumed` bytes.

use crate::protocol::types::{prefix, Frame, Payload, Value, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur while parsing frames.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a text line or map key
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Negative length on a blob or raw frame
    #[error("invalid length: {0}")]
    InvalidLength(i64),

    /// Negative element count on a list or map
    #[error("invalid count: {0}")]
    InvalidCount(i64),

    /// Map keys must be text
    #[error("map key must be text, got {0}")]
    InvalidMapKey(&'static str),

    /// Protocol violation (missing CRLF, too deep, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The frame exceeds the maximum allowed size
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single blob (512 MB)
pub const MAX_BLOB_SIZE: usize = 512 * 1024 * 1024;

/// Maximum nesting depth for lists and maps
pub const MAX_NESTING_DEPTH: usize = 32;

type Parsed<T> = ParseResult<Option<(T, usize)>>;

/// An incremental frame parser.
///
/// # Example
///
/// ```
/// use switchboard::protocol::{FrameParser, Frame};
///
/// let mut parser = FrameParser::new();
/// let input = b"%1\r\n+command\r\n+PING\r\n";
/// let (frame, consumed) = parser.parse(input).unwrap().unwrap();
/// assert_eq!(consumed, input.len());
/// assert!(frame.as_map().is_some());
/// ```
#[derive(Debug, Default)]
pub struct FrameParser {
    /// Current nesting depth
    depth: usize,
}

impl FrameParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one frame from the buffer.
    pub fn parse(&mut self, buf: &[u8]) -> Parsed<Frame> {
        self.depth = 0;
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            prefix::ERROR => Ok(read_line(buf, 1)?.map(|(s, n)| (Frame::Error(s.to_string()), n))),
            prefix::RAW => Ok(read_sized(buf)?.map(|(data, n)| (Frame::Raw(data), n))),
            prefix::TEXT
            | prefix::INTEGER
            | prefix::BLOB
            | prefix::LIST
            | prefix::MAP
            | prefix::NULL => Ok(self.parse_value(buf)?.map(|(v, n)| (Frame::Value(v), n))),
            _ => parse_inline(buf),
        }
    }

    fn parse_value(&mut self, buf: &[u8]) -> Parsed<Value> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::TEXT => Ok(read_line(buf, 1)?.map(|(s, n)| (Value::Text(s.to_string()), n))),
            prefix::INTEGER => self.parse_integer(buf),
            prefix::BLOB => Ok(read_sized(buf)?.map(|(data, n)| (Value::Blob(data), n))),
            prefix::NULL => self.parse_null(buf),
            prefix::LIST => self.parse_list(buf),
            prefix::MAP => self.parse_map(buf),
            other => Err(ParseError::ProtocolError(format!(
                "unexpected type prefix {:#04x} inside a value",
                other
            ))),
        }
    }

    /// Parses an integer: `:<integer>\r\n`
    fn parse_integer(&mut self, buf: &[u8]) -> Parsed<Value> {
        match read_line(buf, 1)? {
            Some((s, consumed)) => {
                let n: i64 = s
                    .parse()
                    .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
                Ok(Some((Value::Integer(n), consumed)))
            }
            None => Ok(None),
        }
    }

    /// Parses a null: `_\r\n`
    fn parse_null(&mut self, buf: &[u8]) -> Parsed<Value> {
        match read_line(buf, 1)? {
            Some(("", consumed)) => Ok(Some((Value::Null, consumed))),
            Some((other, _)) => Err(ParseError::ProtocolError(format!(
                "null frame carries data: {:?}",
                other
            ))),
            None => Ok(None),
        }
    }

    /// Parses a list: `*<count>\r\n<elements...>`
    fn parse_list(&mut self, buf: &[u8]) -> Parsed<Value> {
        let (count, mut consumed) = match read_count(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let mut items = Vec::with_capacity(count.min(1024));
        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, n)) => {
                    items.push(value);
                    consumed += n;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((Value::List(items), consumed)))
    }

    /// Parses a map: `%<pairs>\r\n<key><value>...`
    fn parse_map(&mut self, buf: &[u8]) -> Parsed<Value> {
        let (count, mut consumed) = match read_count(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let mut map = Payload::with_capacity(count.min(1024));
        self.depth += 1;
        for _ in 0..count {
            let key = match self.parse_value(&buf[consumed..])? {
                Some((key, n)) => {
                    consumed += n;
                    map_key(key)?
                }
                None => return Ok(None),
            };
            match self.parse_value(&buf[consumed..])? {
                Some((value, n)) => {
                    map.insert(key, value);
                    consumed += n;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((Value::Map(map), consumed)))
    }
}

fn map_key(key: Value) -> ParseResult<String> {
    match key {
        Value::Text(s) => Ok(s),
        Value::Blob(b) => String::from_utf8(b.to_vec())
            .map_err(|e| ParseError::InvalidUtf8(e.to_string())),
        Value::Integer(_) => Err(ParseError::InvalidMapKey("integer")),
        Value::List(_) => Err(ParseError::InvalidMapKey("list")),
        Value::Map(_) => Err(ParseError::InvalidMapKey("map")),
        Value::Null => Err(ParseError::InvalidMapKey("null")),
    }
}

/// Reads the line after a `skip`-byte prefix. Returns the line and the
/// total bytes consumed including the CRLF.
fn read_line(buf: &[u8], skip: usize) -> ParseResult<Option<(&str, usize)>> {
    match find_crlf(&buf[skip..]) {
        Some(pos) => {
            let s = std::str::from_utf8(&buf[skip..skip + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((s, skip + pos + 2)))
        }
        None => Ok(None),
    }
}

/// Reads a `<prefix><count>\r\n` header for lists and maps.
fn read_count(buf: &[u8]) -> ParseResult<Option<(usize, usize)>> {
    let (line, consumed) = match read_line(buf, 1)? {
        Some(header) => header,
        None => return Ok(None),
    };
    let count: i64 = line
        .parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
    if count < 0 {
        return Err(ParseError::InvalidCount(count));
    }
    Ok(Some((count as usize, consumed)))
}

/// Reads a `<prefix><len>\r\n<data>\r\n` body for blobs and raw streams.
fn read_sized(buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
    let (line, data_start) = match read_line(buf, 1)? {
        Some(header) => header,
        None => return Ok(None),
    };
    let length: i64 = line
        .parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
    if length < 0 {
        return Err(ParseError::InvalidLength(length));
    }

    let length = length as usize;
    if length > MAX_BLOB_SIZE {
        return Err(ParseError::FrameTooLarge {
            size: length,
            max: MAX_BLOB_SIZE,
        });
    }

    let total_needed = data_start + length + 2;
    if buf.len() < total_needed {
        return Ok(None);
    }

    if &buf[data_start + length..total_needed] != CRLF {
        return Err(ParseError::ProtocolError(
            "blob missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
    Ok(Some((data, total_needed)))
}

/// Parses the telnet-friendly form `COMMAND key=value key=value`.
fn parse_inline(buf: &[u8]) -> Parsed<Frame> {
    let (line, consumed) = match read_line(buf, 0)? {
        Some(line) => line,
        None => return Ok(None),
    };

    let mut parts = line.split_whitespace();
    let command = match parts.next() {
        Some(command) => command,
        None => {
            return Err(ParseError::ProtocolError(
                "empty inline command".to_string(),
            ))
        }
    };

    let mut map = Payload::new();
    map.insert("command".to_string(), Value::text(command));
    for part in parts {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        map.insert(key.to_string(), Value::text(value));
    }

    Ok(Some((Frame::Value(Value::Map(map)), consumed)))
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Longest count or length header the skipper waits for.
const MAX_HEADER_LEN: usize = 32;

/// Progress of a [`FrameSkipper`] over one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skipped {
    /// The frame ended after this many bytes; the rest is new input.
    Done(usize),
    /// This many bytes belong to the frame and can be dropped; the frame
    /// continues in later reads.
    Partial(usize),
}

/// Walks over one frame without materializing it.
///
/// Used once a frame has been rejected for size: the remainder may still be
/// arriving and none of it may be read as a new message. Only headers are
/// inspected; blob and raw bodies are skipped by length.
#[derive(Debug, Default)]
pub struct FrameSkipper {
    /// Items still expected by each open list or map
    open: Vec<usize>,
    /// Body bytes left to skip, trailing CRLF included
    body: usize,
    /// Skipping a line whose CRLF has not been seen
    in_line: bool,
    /// Total bytes skipped so far
    skipped: u64,
}

impl FrameSkipper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes skipped since the frame started.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Skips as much of the frame as `buf` holds. `buf` must start where the
    /// previous call left off.
    pub fn skip(&mut self, buf: &[u8]) -> ParseResult<Skipped> {
        let result = self.advance(buf);
        if let Ok(Skipped::Done(n) | Skipped::Partial(n)) = result {
            self.skipped += n as u64;
        }
        result
    }

    fn advance(&mut self, buf: &[u8]) -> ParseResult<Skipped> {
        let mut pos = 0;
        loop {
            if self.body > 0 {
                let n = self.body.min(buf.len() - pos);
                self.body -= n;
                pos += n;
                if self.body > 0 {
                    return Ok(Skipped::Partial(pos));
                }
                if self.item_done() {
                    return Ok(Skipped::Done(pos));
                }
                continue;
            }

            if self.in_line {
                match find_crlf(&buf[pos..]) {
                    Some(at) => {
                        pos += at + 2;
                        self.in_line = false;
                        if self.item_done() {
                            return Ok(Skipped::Done(pos));
                        }
                        continue;
                    }
                    None => {
                        // A trailing CR may be the first half of the CRLF.
                        let keep = usize::from(buf.len() > pos && buf[buf.len() - 1] == b'\r');
                        return Ok(Skipped::Partial(buf.len() - keep));
                    }
                }
            }

            let rest = &buf[pos..];
            if rest.is_empty() {
                return Ok(Skipped::Partial(pos));
            }

            match rest[0] {
                prefix::BLOB | prefix::RAW => match read_line(rest, 1)? {
                    Some((line, n)) => {
                        let length: i64 = line
                            .parse()
                            .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
                        if length < 0 {
                            return Err(ParseError::InvalidLength(length));
                        }
                        self.body = length as usize + 2;
                        pos += n;
                    }
                    None => return self.wait_for_header(rest, pos),
                },
                prefix::LIST | prefix::MAP => match read_count(rest)? {
                    Some((count, n)) => {
                        pos += n;
                        let items = if rest[0] == prefix::MAP { count.saturating_mul(2) } else { count };
                        if items == 0 {
                            if self.item_done() {
                                return Ok(Skipped::Done(pos));
                            }
                        } else {
                            if self.open.len() >= MAX_NESTING_DEPTH {
                                return Err(ParseError::ProtocolError(format!(
                                    "maximum nesting depth exceeded: {}",
                                    MAX_NESTING_DEPTH
                                )));
                            }
                            self.open.push(items);
                        }
                    }
                    None => return self.wait_for_header(rest, pos),
                },
                prefix::TEXT | prefix::ERROR | prefix::INTEGER | prefix::NULL => {
                    self.in_line = true;
                    pos += 1;
                }
                _ if self.open.is_empty() => self.in_line = true,
                other => {
                    return Err(ParseError::ProtocolError(format!(
                        "unexpected type prefix {:#04x} inside a value",
                        other
                    )))
                }
            }
        }
    }

    /// Keeps an unterminated count or length header for the next read.
    fn wait_for_header(&self, rest: &[u8], pos: usize) -> ParseResult<Skipped> {
        if rest.len() > MAX_HEADER_LEN {
            return Err(ParseError::ProtocolError("unterminated frame header".to_string()));
        }
        Ok(Skipped::Partial(pos))
    }

    /// Marks one item complete. Returns true once the whole frame is.
    fn item_done(&mut self) -> bool {
        while let Some(remaining) = self.open.last_mut() {
            *remaining -= 1;
            if *remaining > 0 {
                return false;
            }
            self.open.pop();
        }
        true
    }
}

/// Helper function to parse a single frame from bytes.
pub fn parse_frame(buf: &[u8]) -> Parsed<Frame> {
    FrameParser::new().parse(buf)
}
