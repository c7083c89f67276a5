//! Handler Contract
//!
//! Every command implementation is a [`Handler`]. The dispatcher resolves a
//! handler from the registry and calls [`Handler::process`] with the decoded
//! request, the connection's session, and a [`ConnectionContext`] that carries
//! the process-wide state the handler may touch.
//!
//! ## Response Modes
//!
//! A handler returns a [`Reply`]:
//!
//! - `Reply::Data`: a structured map written as a map frame
//! - `Reply::Raw`: bytes written as a raw stream frame
//! - `Reply::File`: a file streamed from disk as a raw stream frame
//!
//! ## Failures
//!
//! Expected failures (missing field, duplicate user) are
//! [`HandlerError::Rejected`] and carry an error code for the client.
//! Anything else is a [`HandlerError::Fault`]. A panic inside `process` is
//! caught by the dispatcher and treated like a fault.

use crate::commands::Direction;
use crate::config::FileConfig;
use crate::protocol::{Outcome, Payload, Request, Value};
use crate::storage::{Session, SessionId, SharedStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Response map key for a typed error code.
pub const ERROR_CODE_KEY: &str = "error_code";

/// Response map key for a human-readable error message.
pub const ERROR_MESSAGE_KEY: &str = "error_message";

/// Error code sent for handler faults.
pub const INTERNAL_ERROR_CODE: &str = "internal";

/// What a handler wants written back to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Data(Payload),
    Raw(Bytes),
    File(PathBuf),
}

impl Reply {
    /// An empty structured response.
    pub fn empty() -> Self {
        Reply::Data(Payload::new())
    }

    /// Builds a structured response from key/value pairs.
    pub fn data<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Reply::Data(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Errors a handler can return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// A typed, expected failure reported back to the client.
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    /// An unexpected failure inside the handler.
    #[error("handler fault: {0}")]
    Fault(String),
}

impl HandlerError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        HandlerError::Fault(message.into())
    }

    /// The outcome recorded for this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            HandlerError::Rejected { .. } => Outcome::failure(self.to_string()),
            HandlerError::Fault(msg) => Outcome::fault(msg.clone()),
        }
    }

    /// The structured response sent to the client.
    pub fn to_payload(&self) -> Payload {
        let (code, message) = match self {
            HandlerError::Rejected { code, message } => (code.as_str(), message.as_str()),
            HandlerError::Fault(msg) => (INTERNAL_ERROR_CODE, msg.as_str()),
        };
        error_payload(code, message)
    }
}

/// Builds an `{error_code, error_message}` map.
pub fn error_payload(code: &str, message: &str) -> Payload {
    let mut payload = Payload::with_capacity(2);
    payload.insert(ERROR_CODE_KEY.to_string(), Value::text(code));
    payload.insert(ERROR_MESSAGE_KEY.to_string(), Value::text(message));
    payload
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::Fault(format!("I/O error: {}", e))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Fault(format!("JSON error: {}", e))
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        HandlerError::Fault(format!("store error: {}", e))
    }
}

/// Per-connection view of process state, handed to every handler call.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub session_id: SessionId,
    pub peer: SocketAddr,
    pub direction: Direction,
    pub store: Arc<SharedStore>,
    pub files: Arc<FileConfig>,
}

impl ConnectionContext {
    pub fn new(
        session: &Session,
        direction: Direction,
        store: Arc<SharedStore>,
        files: Arc<FileConfig>,
    ) -> Self {
        Self {
            session_id: session.id(),
            peer: session.peer(),
            direction,
            store,
            files,
        }
    }
}

/// A command implementation.
///
/// One instance is created per registered command at bootstrap and shared by
/// every connection, so implementations keep per-client state in the
/// [`Session`] and cross-client state in the [`SharedStore`].
///
/// A handler should set the request outcome with [`Request::set_outcome`].
/// When it does not, the dispatcher derives one from the returned result.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn process(
        &self,
        request: &mut Request,
        session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError>;

    /// Identifier used in logs.
    fn name(&self) -> &'static str;
}

/// A hook that sees every request of one [`Direction`] before its handler
/// is resolved.
///
/// A filter may rewrite the request (add derived fields, normalise values)
/// or refuse it. A refusal is answered and journaled exactly like the same
/// error returned by a handler, and the handler never runs.
#[async_trait]
pub trait RequestFilter: Send + Sync + 'static {
    async fn filter(
        &self,
        request: &mut Request,
        session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Result<(), HandlerError>;

    /// Identifier used in logs.
    fn name(&self) -> &'static str;
}

/// Shared reference to a filter.
pub type FilterRef = Arc<dyn RequestFilter>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultCode;

    #[test]
    fn test_reply_data() {
        let reply = Reply::data([("a", "1"), ("b", "2")]);
        let Reply::Data(map) = reply else {
            panic!("expected data reply");
        };
        assert_eq!(map.keys().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(Reply::empty(), Reply::Data(Payload::new()));
    }

    #[test]
    fn test_rejected_payload_and_outcome() {
        let err = HandlerError::rejected("createuser_02", "password is required");
        let payload = err.to_payload();
        assert_eq!(payload[ERROR_CODE_KEY], Value::text("createuser_02"));
        assert_eq!(payload[ERROR_MESSAGE_KEY], Value::text("password is required"));

        let outcome = err.outcome();
        assert_eq!(outcome.code, ResultCode::Failure);
        assert_eq!(
            outcome.detail.as_deref(),
            Some("createuser_02: password is required")
        );
    }

    #[test]
    fn test_io_error_becomes_fault() {
        let err: HandlerError = std::io::Error::other("disk full").into();
        assert_eq!(err.outcome().code, ResultCode::HandlerFault);
        assert_eq!(err.to_payload()[ERROR_CODE_KEY], Value::text(INTERNAL_ERROR_CODE));
    }
}
