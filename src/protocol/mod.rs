//! Message Envelope Implementation
//!
//! This module provides the wire envelope the dispatcher reads from and writes
//! to a connection.
//!
//! ## Overview
//!
//! Every inbound message is a map frame carrying a `command` key plus an
//! arbitrary key/value payload. String fields, binary blobs and nested lists
//! can all live side by side in the same map.
//!
//! ## Modules
//!
//! - `types`: Defines `Value`, `Frame` and serialization
//! - `parser`: Incremental parser for incoming frames
//! - `request`: Typed `Request` with outcome tracking
//!
//! ## Example
//!
//! ```
//! use switchboard::protocol::{parse_frame, Request};
//!
//! let data = b"%2\r\n+command\r\n+ADD_USER\r\n+username\r\n+alice\r\n";
//! let (frame, consumed) = parse_frame(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//!
//! let request = Request::from_frame(frame).unwrap();
//! assert_eq!(request.command(), "ADD_USER");
//! ```

pub mod parser;
pub mod request;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_frame, FrameParser, FrameSkipper, ParseError, ParseResult, Skipped};
pub use request::{Outcome, Request, RequestError, ResultCode};
pub use types::{Frame, Payload, Value};
