//! Persistence Sinks
//!
//! A sink is the durable end of the journal. The workers call
//! [`PersistenceSink::persist`] once per transaction and own the retry
//! policy, so a sink only has to report whether a single write worked.

use crate::journal::Transaction;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Notify;

/// Errors a sink can report for one write.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for completed transactions.
#[async_trait]
pub trait PersistenceSink: Send + Sync + 'static {
    /// Stores one transaction.
    async fn persist(&self, transaction: &Transaction) -> Result<(), SinkError>;

    /// Flushes buffered writes. Called once when the journal shuts down.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Short name for log lines.
    fn name(&self) -> &'static str;
}

/// Appends one JSON document per line to a file.
pub struct FileSink {
    path: PathBuf,
    writer: tokio::sync::Mutex<BufWriter<File>>,
}

impl FileSink {
    /// Opens (or creates) the journal file in append mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            writer: tokio::sync::Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").field("path", &self.path).finish()
    }
}

#[async_trait]
impl PersistenceSink for FileSink {
    async fn persist(&self, transaction: &Transaction) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(transaction)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.get_ref().sync_data().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Keeps transactions in memory. Useful for tests and for embedding the
/// server where another component reads the journal directly.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Transaction>>,
    notify: Notify,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Transaction> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `count` transactions were persisted or the
    /// timeout elapses. Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len() >= count;
            }
        }
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn persist(&self, transaction: &Transaction) -> Result<(), SinkError> {
        self.records.lock().push(transaction.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Value};
    use crate::storage::SessionId;
    use bytes::Bytes;

    fn transaction() -> Transaction {
        let request = Request::new("UPLOAD_USER_PIC")
            .with("file", Value::blob(Bytes::from_static(b"\x89PNG....")))
            .with("username", "alice");
        Transaction::new(SessionId(9), "10.0.0.1:1234".parse().unwrap(), request)
    }

    #[tokio::test]
    async fn test_file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal").join("transactions.log");
        let sink = FileSink::open(&path).await.unwrap();

        sink.persist(&transaction()).await.unwrap();
        sink.persist(&transaction()).await.unwrap();
        sink.flush().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["session"], 9);
        assert_eq!(record["outcome"]["code"], "000");
        assert_eq!(record["request"]["command"], "UPLOAD_USER_PIC");
        assert_eq!(record["request"]["fields"]["file"]["blob_len"], 8);
        assert_eq!(record["request"]["fields"]["result-code"], "000");
    }

    #[tokio::test]
    async fn test_file_sink_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        FileSink::open(&path).await.unwrap().persist(&transaction()).await.unwrap();
        FileSink::open(&path).await.unwrap().persist(&transaction()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_memory_sink_wait_for() {
        let sink = std::sync::Arc::new(MemorySink::new());
        assert!(!sink.wait_for(1, Duration::from_millis(20)).await);

        let writer = std::sync::Arc::clone(&sink);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.persist(&transaction()).await.unwrap();
        });

        assert!(sink.wait_for(1, Duration::from_secs(1)).await);
        assert_eq!(sink.records()[0].command(), "UPLOAD_USER_PIC");
    }
}
