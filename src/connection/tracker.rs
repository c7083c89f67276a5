//! Live Connection Tracking
//!
//! The [`ConnectionTracker`] hands out connection ids and keeps a close
//! handle for every live connection, so a connection can be closed from
//! outside its own task: one at a time with [`ConnectionTracker::close`], or
//! all at once on shutdown with [`ConnectionTracker::close_all`].
//!
//! Registration returns a [`ConnectionGuard`]. Dropping the guard removes
//! the connection from the tracker, however the connection task ends.

use crate::storage::SessionId;
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::debug;

struct TrackedConnection {
    peer: SocketAddr,
    connected_at: Instant,
    close_tx: watch::Sender<bool>,
}

/// Read-only view of one tracked connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub age_ms: u64,
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionTracker {
    next_id: AtomicU64,
    live: DashMap<SessionId, TrackedConnection>,
    idle: Notify,
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("live", &self.live.len())
            .finish()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its guard.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (close_tx, close_rx) = watch::channel(false);
        self.live.insert(
            id,
            TrackedConnection {
                peer,
                connected_at: Instant::now(),
                close_tx,
            },
        );

        ConnectionGuard {
            id,
            peer,
            close_rx,
            tracker: Arc::clone(self),
        }
    }

    /// Asks one connection to close. Returns `false` if it is not live.
    pub fn close(&self, id: SessionId) -> bool {
        match self.live.get(&id) {
            Some(conn) => {
                let _ = conn.close_tx.send(true);
                debug!(connection = %id, client = %conn.peer, "Close requested");
                true
            }
            None => false,
        }
    }

    /// Asks every live connection to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let mut count = 0;
        for conn in self.live.iter() {
            let _ = conn.close_tx.send(true);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<_> = self
            .live
            .iter()
            .map(|entry| ConnectionInfo {
                id: entry.key().0,
                peer: entry.peer,
                age_ms: entry.connected_at.elapsed().as_millis() as u64,
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    /// Waits until no connection is live. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.live.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.live.is_empty();
            }
        }
    }

    fn remove(&self, id: SessionId) {
        self.live.remove(&id);
        if self.live.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Membership of one connection in the tracker.
pub struct ConnectionGuard {
    id: SessionId,
    peer: SocketAddr,
    close_rx: watch::Receiver<bool>,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// A receiver that flips to `true` when the connection should close.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
        debug!(connection = %self.id, client = %self.peer, "Connection untracked");
    }
}
