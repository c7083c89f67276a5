//! Transaction Queue
//!
//! The queue sits between the dispatcher and the persistence workers. Enqueue
//! is a synchronous push onto an unbounded channel: it never awaits, so a
//! slow or stalled sink can never add latency to a response. Numbering and
//! sending share one short lock, so sequence numbers follow channel order.
//!
//! ## High-Water Mark
//!
//! Memory grows if persistence falls behind. When the number of pending
//! transactions reaches the configured high-water mark, transactions whose
//! command is listed as sampled are dropped instead of queued. Every other
//! command is always accepted.

use crate::journal::JournalConfig;
use crate::protocol::{Outcome, Request};
use crate::storage::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// One completed request, ready to be persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    /// Completion order, assigned at enqueue time.
    pub sequence: u64,
    pub session: u64,
    pub peer: SocketAddr,
    pub completed_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub request: Request,
}

impl Transaction {
    /// Snapshots a request whose outcome has already been stamped.
    pub fn new(session: SessionId, peer: SocketAddr, mut request: Request) -> Self {
        let outcome = request.stamp_outcome();
        Self {
            sequence: 0,
            session: session.0,
            peer,
            completed_at: Utc::now(),
            outcome,
            request,
        }
    }

    pub fn command(&self) -> &str {
        self.request.command()
    }
}

/// What happened to an enqueued transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    Queued,
    /// Dropped by the high-water mark policy.
    Sampled,
    /// The journal is shutting down.
    Closed,
}

/// Counters shared by the queue and its workers.
#[derive(Debug, Default)]
pub struct JournalStats {
    pub enqueued: AtomicU64,
    pub sampled: AtomicU64,
    pub rejected: AtomicU64,
    pub persisted: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    pending: AtomicUsize,
}

impl JournalStats {
    /// Transactions queued but not yet taken by a worker.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> JournalSnapshot {
        JournalSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sampled: self.sampled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.pending() as u64,
        }
    }
}

/// Plain copy of [`JournalStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JournalSnapshot {
    pub enqueued: u64,
    pub sampled: u64,
    pub rejected: u64,
    pub persisted: u64,
    pub retried: u64,
    pub failed: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Default)]
struct QueuePolicy {
    high_water_mark: usize,
    sampled_commands: HashSet<String>,
}

impl QueuePolicy {
    fn should_sample(&self, command: &str, pending: usize) -> bool {
        self.high_water_mark > 0
            && pending >= self.high_water_mark
            && self.sampled_commands.contains(command)
    }
}

/// The producer side. Cheap to clone; every connection holds one.
#[derive(Debug, Clone)]
pub struct TransactionQueue {
    tx: mpsc::UnboundedSender<Transaction>,
    policy: Arc<QueuePolicy>,
    stats: Arc<JournalStats>,
    /// Last sequence number handed out
    sequence: Arc<SyncMutex<u64>>,
    closed: Arc<AtomicBool>,
}

impl TransactionQueue {
    /// Creates a queue and the receiver the workers drain.
    pub fn new(config: &JournalConfig) -> (Self, TransactionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(JournalStats::default());
        let closed = Arc::new(AtomicBool::new(false));
        let policy = QueuePolicy {
            high_water_mark: config.high_water_mark,
            sampled_commands: config.sampled_commands.iter().cloned().collect(),
        };

        let queue = Self {
            tx,
            policy: Arc::new(policy),
            stats: Arc::clone(&stats),
            sequence: Arc::new(SyncMutex::new(0)),
            closed: Arc::clone(&closed),
        };
        let receiver = TransactionReceiver {
            rx: Mutex::new(rx),
            stats,
            closed,
        };
        (queue, receiver)
    }

    /// Appends a transaction. Never blocks and never fails the caller.
    pub fn enqueue(&self, mut transaction: Transaction) -> EnqueueStatus {
        if self.closed.load(Ordering::Acquire) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(command = %transaction.command(), "Journal closed, transaction discarded");
            return EnqueueStatus::Closed;
        }

        let pending = self.stats.pending();
        if self.policy.should_sample(transaction.command(), pending) {
            self.stats.sampled.fetch_add(1, Ordering::Relaxed);
            trace!(command = %transaction.command(), pending, "Above high-water mark, sampled out");
            return EnqueueStatus::Sampled;
        }

        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        let sent = {
            let mut sequence = self.sequence.lock();
            transaction.sequence = *sequence + 1;
            let sent = self.tx.send(transaction);
            if sent.is_ok() {
                *sequence += 1;
            }
            sent
        };
        match sent {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                EnqueueStatus::Queued
            }
            Err(_) => {
                self.stats.pending.fetch_sub(1, Ordering::Relaxed);
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                EnqueueStatus::Closed
            }
        }
    }

    pub fn stats(&self) -> &Arc<JournalStats> {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The consumer side, shared by all journal workers.
#[derive(Debug)]
pub struct TransactionReceiver {
    rx: Mutex<mpsc::UnboundedReceiver<Transaction>>,
    stats: Arc<JournalStats>,
    closed: Arc<AtomicBool>,
}

impl TransactionReceiver {
    /// Takes the next transaction in FIFO order. Returns `None` once the
    /// queue is closed and empty.
    pub async fn recv(&self) -> Option<Transaction> {
        let item = self.rx.lock().await.recv().await;
        if item.is_some() {
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Stops accepting new transactions. Already queued ones can still be
    /// received.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.rx.lock().await.close();
    }

    pub fn stats(&self) -> &Arc<JournalStats> {
        &self.stats
    }
}
