//! Transaction Journal Module
//!
//! Every processed request, successful or not, is recorded here. The journal
//! is fully decoupled from the response path: the dispatcher enqueues the
//! finished request and moves on, and background workers persist it later.
//!
//! ## Architecture
//!
//! ```text
//!  Connection tasks                     Background
//! ┌──────────────┐
//! │ Dispatcher A │──┐
//! └──────────────┘  │  enqueue()    ┌──────────────────┐   persist()   ┌──────────┐
//! ┌──────────────┐  ├──(no await)──>│ TransactionQueue │──────────────>│   Sink   │
//! │ Dispatcher B │──┘               │   (unbounded)    │  JournalWorker │ (file,   │
//! └──────────────┘                  └──────────────────┘  retry/drop    │  memory) │
//!                                                                       └──────────┘
//! ```

pub mod queue;
pub mod sink;
pub mod worker;

use serde::Deserialize;
use std::path::PathBuf;

pub use queue::{
    EnqueueStatus, JournalSnapshot, JournalStats, Transaction, TransactionQueue,
    TransactionReceiver,
};
pub use sink::{FileSink, MemorySink, PersistenceSink, SinkError};
pub use worker::{JournalHandle, JournalWorker, RetryPolicy};

/// `[journal]` section of the server configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct JournalConfig {
    /// JSON-lines file the default sink appends to.
    pub path: PathBuf,
    /// Number of workers draining the queue.
    pub workers: usize,
    /// Retries after the first failed write.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Upper bound for a single sink write.
    pub attempt_timeout_ms: u64,
    /// Pending count at which sampled commands start being dropped. 0 disables.
    pub high_water_mark: usize,
    /// Commands that may be dropped above the high-water mark.
    pub sampled_commands: Vec<String>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("transactions.log"),
            workers: 1,
            max_retries: 3,
            retry_delay_ms: 200,
            attempt_timeout_ms: 5_000,
            high_water_mark: 0,
            sampled_commands: Vec::new(),
        }
    }
}
