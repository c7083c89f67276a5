//! Per-Connection Sessions
//!
//! A [`Session`] is the attribute bag that belongs to exactly one connection.
//! It is created when the connection is accepted, owned by that connection's
//! task, and dropped when the connection closes. Because it is never shared,
//! it needs no locking: handlers get `&mut Session` for the duration of one
//! request.

use crate::protocol::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Attribute under which the captcha handlers keep the expected answer.
pub const CAPTCHA_ATTRIBUTE: &str = "sso_captcha";

/// Connection-scoped identifier. Unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Attribute bag for one connection.
///
/// Values are opaque to this layer; handlers decide what they store and how
/// to read it back.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    created_at: Instant,
    attributes: HashMap<String, Value>,
}

impl Session {
    pub fn new(id: SessionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            created_at: Instant::now(),
            attributes: HashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Sets an attribute, returning the previous value.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(key.into(), value.into())
    }

    pub fn get_attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Convenience for text attributes.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }
}
