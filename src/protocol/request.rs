//! Requests and Outcomes
//!
//! A [`Request`] is the decoded form of one inbound map frame. The `command`
//! key is lifted into a typed field; every other key stays in the ordered
//! `fields` bag for the handler to interpret.

use crate::protocol::types::{Frame, Payload, Value};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Key holding the command code in the wire map.
pub const COMMAND_KEY: &str = "command";

/// Key the outcome code is stamped under before journaling.
pub const RESULT_CODE_KEY: &str = "result-code";

/// Key the outcome detail (if any) is stamped under before journaling.
pub const RESULT_DETAIL_KEY: &str = "result-detail";

/// Reasons a well-framed message is not a valid request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request must be a map, got {0}")]
    NotAMap(&'static str),

    #[error("request has no command field")]
    MissingCommand,

    #[error("command field must be non-empty text")]
    InvalidCommand,
}

/// Outcome code recorded on every processed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResultCode {
    /// The handler completed normally.
    #[serde(rename = "000")]
    Success,
    /// The handler reported a typed failure (validation, conflict, ...).
    #[serde(rename = "001")]
    Failure,
    /// No handler is registered for the command.
    #[serde(rename = "002")]
    UnknownCommand,
    /// The handler raised a fault or panicked.
    #[serde(rename = "003")]
    HandlerFault,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "000",
            ResultCode::Failure => "001",
            ResultCode::UnknownCommand => "002",
            ResultCode::HandlerFault => "003",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of processing one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            code: ResultCode::Success,
            detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Failure,
            detail: Some(detail.into()),
        }
    }

    pub fn unknown_command(command: &str) -> Self {
        Self {
            code: ResultCode::UnknownCommand,
            detail: Some(format!("unknown command '{}'", command)),
        }
    }

    pub fn fault(detail: impl Into<String>) -> Self {
        Self {
            code: ResultCode::HandlerFault,
            detail: Some(detail.into()),
        }
    }
}

/// A decoded request.
///
/// Handlers receive `&mut Request` so they can read payload fields, add
/// derived fields, and set the outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    command: String,
    fields: Payload,
    #[serde(skip)]
    outcome: Option<Outcome>,
}

impl Request {
    /// Creates a request with an empty payload.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fields: Payload::new(),
            outcome: None,
        }
    }

    /// Builder-style helper to add a payload field.
    ///
    /// # Example
    /// ```
    /// use switchboard::protocol::Request;
    /// let req = Request::new("ADD_USER").with("username", "alice");
    /// assert_eq!(req.get_str("username"), Some("alice"));
    /// ```
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Decodes a parsed frame into a request.
    pub fn from_frame(frame: Frame) -> Result<Self, RequestError> {
        match frame {
            Frame::Value(Value::Map(map)) => Self::from_payload(map),
            Frame::Value(Value::Text(_)) => Err(RequestError::NotAMap("text")),
            Frame::Value(Value::Integer(_)) => Err(RequestError::NotAMap("integer")),
            Frame::Value(Value::Blob(_)) => Err(RequestError::NotAMap("blob")),
            Frame::Value(Value::List(_)) => Err(RequestError::NotAMap("list")),
            Frame::Value(Value::Null) => Err(RequestError::NotAMap("null")),
            Frame::Error(_) => Err(RequestError::NotAMap("error")),
            Frame::Raw(_) => Err(RequestError::NotAMap("raw stream")),
        }
    }

    /// Lifts the `command` key out of a payload map.
    pub fn from_payload(mut fields: Payload) -> Result<Self, RequestError> {
        let command = match fields.shift_remove(COMMAND_KEY) {
            Some(value) => match value.as_str() {
                Some(s) if !s.trim().is_empty() => s.trim().to_string(),
                _ => return Err(RequestError::InvalidCommand),
            },
            None => return Err(RequestError::MissingCommand),
        };

        Ok(Self {
            command,
            fields,
            outcome: None,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn fields(&self) -> &Payload {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a field as trimmed text, treating blank text as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Sets the outcome. Handlers call this before returning; the dispatcher
    /// fills it in when they do not.
    pub fn set_outcome(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }

    /// Writes the outcome into the payload under `result-code` and
    /// `result-detail`, returning the stamped outcome.
    pub fn stamp_outcome(&mut self) -> Outcome {
        let outcome = self.outcome.clone().unwrap_or_else(Outcome::success);
        self.fields
            .insert(RESULT_CODE_KEY.to_string(), Value::text(outcome.code.as_str()));
        match &outcome.detail {
            Some(detail) => {
                self.fields
                    .insert(RESULT_DETAIL_KEY.to_string(), Value::text(detail.clone()));
            }
            None => {
                self.fields.shift_remove(RESULT_DETAIL_KEY);
            }
        }
        outcome
    }

    /// Converts the request back into its wire map.
    pub fn to_frame(&self) -> Frame {
        let mut map = Payload::with_capacity(self.fields.len() + 1);
        map.insert(COMMAND_KEY.to_string(), Value::text(self.command.clone()));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Frame::map(map)
    }
}
