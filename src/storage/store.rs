//! Process-Wide Attribute Store
//!
//! This module implements the shared, namespaced key-value store handlers use
//! for cross-request state, such as the credential cache
//! (`credentials_id/<user id> → username`, `credentials/<username> → record`).
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Entries are spread over 64 shards so unrelated
//!    connections rarely contend on the same lock.
//! 2. **Namespaces**: Every key lives in a namespace, so two handlers can use
//!    the same key without colliding.
//! 3. **Expiry Policy**: Entries never expire unless a default TTL is
//!    configured or the writer asks for one. Expired entries are removed on
//!    access and by the background [`ExpirySweeper`](super::ExpirySweeper).
//! 4. **No Transactions**: The store is a cache. It is not kept transactional
//!    with any system of record; writers update both and accept eventual
//!    consistency.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SharedStore                            │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ ns → kv │ │ ns → kv │ │ ns → kv │ │ ns → kv │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Locks are held only for the map operation itself, never across an
//! `.await`, so store access cannot stall another connection's I/O.

use crate::protocol::Value;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of shards in the store.
const NUM_SHARDS: usize = 64;

/// Namespace for the user id → username side of the credential cache.
pub const CREDENTIALS_ID_NAMESPACE: &str = "credentials_id";

/// Namespace for the username → serialized credential record side.
pub const CREDENTIALS_NAMESPACE: &str = "credentials";

/// A stored value with optional expiry time.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    /// The stored value
    pub value: Value,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// When this entry was written
    pub written_at: Instant,
}

impl StoreEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
            written_at: now,
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }
}

type Namespaces = HashMap<String, HashMap<String, StoreEntry>>;

#[derive(Debug, Default)]
struct Shard {
    data: RwLock<Namespaces>,
}

/// Errors from the typed store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("value at {0} is not an integer")]
    NotAnInteger(String),

    #[error("increment would overflow")]
    Overflow,
}

/// Point-in-time counters for the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub expired: u64,
}

/// The process-wide namespaced store.
///
/// Designed to be wrapped in an `Arc` and shared by every connection.
///
/// # Example
///
/// ```
/// use switchboard::storage::SharedStore;
/// use switchboard::protocol::Value;
///
/// let store = SharedStore::new();
/// store.set("credentials_id", "7", Value::text("alice"));
/// assert_eq!(store.get_str("credentials_id", "7"), Some("alice".to_string()));
///
/// store.delete("credentials_id", "7");
/// assert!(store.get("credentials_id", "7").is_none());
/// ```
pub struct SharedStore {
    shards: Vec<Shard>,
    default_ttl: Option<Duration>,
    entry_count: AtomicU64,
    read_count: AtomicU64,
    write_count: AtomicU64,
    delete_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("shards", &self.shards.len())
            .field("default_ttl", &self.default_ttl)
            .field("entries", &self.entry_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore {
    /// Creates a store whose entries never expire by default.
    pub fn new() -> Self {
        Self::with_default_ttl(None)
    }

    /// Creates a store that applies `ttl` to every plain `set`.
    pub fn with_default_ttl(ttl: Option<Duration>) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            default_ttl: ttl.filter(|ttl| !ttl.is_zero()),
            entry_count: AtomicU64::new(0),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            delete_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    #[inline]
    fn shard(&self, namespace: &str, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        namespace.hash(&mut hasher);
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Stores `value` under `namespace/key` with the default TTL.
    ///
    /// Returns `true` if a new entry was created.
    pub fn set(&self, namespace: &str, key: &str, value: impl Into<Value>) -> bool {
        self.insert(namespace, key, value.into(), self.default_ttl)
    }

    /// Stores `value` under `namespace/key`, expiring after `ttl`.
    pub fn set_with_ttl(
        &self,
        namespace: &str,
        key: &str,
        value: impl Into<Value>,
        ttl: Duration,
    ) -> bool {
        self.insert(namespace, key, value.into(), Some(ttl))
    }

    fn insert(&self, namespace: &str, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        self.write_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(namespace, key).data.write();
        let previous = data
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), StoreEntry::new(value, ttl));

        match previous {
            None => {
                self.entry_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            // The expired entry was already counted, so the total is unchanged.
            Some(old) if old.is_expired() => {
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(_) => false,
        }
    }

    /// Stores `value` only if no live entry exists under `namespace/key`.
    ///
    /// Returns `true` if the value was written.
    pub fn set_nx(&self, namespace: &str, key: &str, value: impl Into<Value>) -> bool {
        let mut data = self.shard(namespace, key).data.write();
        let ns = data.entry(namespace.to_string()).or_default();

        let replaced_expired = match ns.get(key) {
            Some(entry) if !entry.is_expired() => return false,
            Some(_) => true,
            None => false,
        };

        self.write_count.fetch_add(1, Ordering::Relaxed);
        ns.insert(key.to_string(), StoreEntry::new(value.into(), self.default_ttl));
        if replaced_expired {
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Atomically adds `delta` to the integer under `namespace/key`.
    ///
    /// A missing or expired entry counts as 0. Counters never expire.
    pub fn incr_by(&self, namespace: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut data = self.shard(namespace, key).data.write();
        let ns = data.entry(namespace.to_string()).or_default();

        let (current, is_new) = match ns.get(key) {
            Some(entry) if !entry.is_expired() => {
                let current = entry
                    .value
                    .as_integer()
                    .ok_or_else(|| StoreError::NotAnInteger(format!("{}/{}", namespace, key)))?;
                (current, false)
            }
            Some(_) => {
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                (0, false)
            }
            None => (0, true),
        };

        let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        ns.insert(key.to_string(), StoreEntry::new(Value::Integer(next), None));
        if is_new {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(next)
    }

    /// Returns the value under `namespace/key`, or `None` if absent or expired.
    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.get_entry(namespace, key).map(|entry| entry.value)
    }

    /// Returns the value as a string if it is text.
    pub fn get_str(&self, namespace: &str, key: &str) -> Option<String> {
        self.get(namespace, key)
            .and_then(|value| value.as_str().map(str::to_string))
    }

    /// Returns the full entry including expiry metadata.
    pub fn get_entry(&self, namespace: &str, key: &str) -> Option<StoreEntry> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        let shard = self.shard(namespace, key);

        {
            let data = shard.data.read();
            match data.get(namespace).and_then(|ns| ns.get(key)) {
                Some(entry) if !entry.is_expired() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: upgrade to a write lock and remove it.
        let mut data = shard.data.write();
        let ns = data.get_mut(namespace)?;
        match ns.get(key) {
            Some(entry) if entry.is_expired() => {
                ns.remove(key);
                if ns.is_empty() {
                    data.remove(namespace);
                }
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            // Another writer refreshed it in between.
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Removes `namespace/key`.
    ///
    /// Returns `true` if a live entry was removed.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        self.delete_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(namespace, key).data.write();
        let Some(ns) = data.get_mut(namespace) else {
            return false;
        };
        let removed = ns.remove(key);
        if ns.is_empty() {
            data.remove(namespace);
        }

        match removed {
            Some(entry) => {
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                if entry.is_expired() {
                    self.expired_count.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.get_entry(namespace, key).is_some()
    }

    /// Number of live entries in one namespace.
    pub fn namespace_len(&self, namespace: &str) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .data
                    .read()
                    .get(namespace)
                    .map(|ns| ns.values().filter(|e| !e.is_expired()).count())
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Approximate number of entries across all namespaces.
    pub fn len(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.entry_count.load(Ordering::Relaxed),
            reads: self.read_count.load(Ordering::Relaxed),
            writes: self.write_count.load(Ordering::Relaxed),
            deletes: self.delete_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Removes expired entries from every shard.
    ///
    /// Called by the background expiry sweeper. Returns the number removed.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut data = shard.data.write();
            for ns in data.values_mut() {
                let before = ns.len();
                ns.retain(|_, entry| !entry.is_expired());
                cleaned += (before - ns.len()) as u64;
            }
            data.retain(|_, ns| !ns.is_empty());
        }

        if cleaned > 0 {
            self.entry_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }
}
