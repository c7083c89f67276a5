//! Journal Workers
//!
//! Background tasks that drain the [`TransactionReceiver`] and hand each
//! transaction to the [`PersistenceSink`]. A failed write is retried a
//! bounded number of times, then logged and dropped: losing an audit record
//! must never stop the worker or hold up the records behind it.
//!
//! ## Shutdown
//!
//! On shutdown the queue is closed, then whatever is already queued is
//! drained best-effort until the grace period runs out.

use crate::journal::{
    JournalConfig, JournalSnapshot, JournalStats, PersistenceSink, Transaction,
    TransactionReceiver,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Retry settings for one worker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl From<&JournalConfig> for RetryPolicy {
    fn from(config: &JournalConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

/// A single worker draining the shared receiver.
pub struct JournalWorker {
    id: usize,
    receiver: Arc<TransactionReceiver>,
    sink: Arc<dyn PersistenceSink>,
    retry: RetryPolicy,
}

impl JournalWorker {
    pub fn new(
        id: usize,
        receiver: Arc<TransactionReceiver>,
        sink: Arc<dyn PersistenceSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id,
            receiver,
            sink,
            retry,
        }
    }

    /// Runs until shutdown is signalled or the queue closes.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(worker = self.id, sink = self.sink.name(), "Journal worker started");

        loop {
            let next = tokio::select! {
                biased;
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                next = self.receiver.recv() => next,
            };

            match next {
                Some(transaction) => self.persist(transaction).await,
                None => {
                    debug!(worker = self.id, "Transaction queue closed, worker exiting");
                    return;
                }
            }
        }

        // Shutdown: stop intake, then drain what is already queued.
        self.receiver.close().await;
        let mut drained = 0u64;
        while let Some(transaction) = self.receiver.recv().await {
            self.persist(transaction).await;
            drained += 1;
        }
        debug!(worker = self.id, drained, "Journal worker drained and stopped");
    }

    /// Persists one transaction with bounded retries.
    async fn persist(&self, transaction: Transaction) {
        let stats = self.receiver.stats();
        let mut attempt = 0u32;

        loop {
            let result = tokio::time::timeout(
                self.retry.attempt_timeout,
                self.sink.persist(&transaction),
            )
            .await;

            let err = match result {
                Ok(Ok(())) => {
                    stats.persisted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.retry.attempt_timeout),
            };

            if attempt >= self.retry.max_retries {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker = self.id,
                    sequence = transaction.sequence,
                    command = %transaction.command(),
                    error = %err,
                    attempts = attempt + 1,
                    "Dropping transaction after repeated persistence failures"
                );
                return;
            }

            attempt += 1;
            stats.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = self.id,
                sequence = transaction.sequence,
                error = %err,
                attempt,
                "Persistence failed, retrying"
            );
            tokio::time::sleep(self.retry.retry_delay).await;
        }
    }
}

/// Handle to the running worker pool.
pub struct JournalHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    sink: Arc<dyn PersistenceSink>,
    stats: Arc<JournalStats>,
}

impl JournalHandle {
    /// Spawns `config.workers` workers (at least one) over a shared receiver.
    pub fn start(
        config: &JournalConfig,
        receiver: TransactionReceiver,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let receiver = Arc::new(receiver);
        let stats = Arc::clone(receiver.stats());
        let retry = RetryPolicy::from(config);

        let workers = (0..config.workers.max(1))
            .map(|id| {
                let worker = JournalWorker::new(id, Arc::clone(&receiver), Arc::clone(&sink), retry);
                tokio::spawn(worker.run(shutdown_tx.subscribe()))
            })
            .collect::<Vec<_>>();

        info!(
            workers = workers.len(),
            sink = sink.name(),
            "Transaction journal started"
        );

        Self {
            shutdown_tx,
            workers,
            sink,
            stats,
        }
    }

    pub fn stats(&self) -> JournalSnapshot {
        self.stats.snapshot()
    }

    /// Stops the workers, draining queued transactions for at most `grace`.
    pub async fn shutdown(self, grace: Duration) -> JournalSnapshot {
        let _ = self.shutdown_tx.send(true);

        let mut workers = self.workers;
        let joined = tokio::time::timeout(grace, async {
            for worker in workers.iter_mut() {
                let _ = worker.await;
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                pending = self.stats.pending(),
                "Journal drain exceeded grace period, abandoning remaining transactions"
            );
            for worker in &workers {
                worker.abort();
            }
        }

        if let Err(e) = self.sink.flush().await {
            error!(error = %e, "Failed to flush journal sink on shutdown");
        }

        let snapshot = self.stats.snapshot();
        info!(
            persisted = snapshot.persisted,
            failed = snapshot.failed,
            sampled = snapshot.sampled,
            "Transaction journal stopped"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{MemorySink, SinkError, TransactionQueue};
    use crate::protocol::Request;
    use crate::storage::SessionId;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn transaction(command: &str) -> Transaction {
        Transaction::new(
            SessionId(1),
            "127.0.0.1:6000".parse().unwrap(),
            Request::new(command),
        )
    }

    fn fast_config() -> JournalConfig {
        JournalConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            attempt_timeout_ms: 50,
            ..Default::default()
        }
    }

    /// Fails the first `failures` writes, then succeeds.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        inner: MemorySink,
    }

    #[async_trait]
    impl PersistenceSink for FlakySink {
        async fn persist(&self, transaction: &Transaction) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SinkError::Unavailable("database down".into()));
            }
            self.inner.persist(transaction).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Never completes a write.
    struct StalledSink;

    #[async_trait]
    impl PersistenceSink for StalledSink {
        async fn persist(&self, _transaction: &Transaction) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_worker_persists_in_order() {
        let config = fast_config();
        let (queue, receiver) = TransactionQueue::new(&config);
        let sink = Arc::new(MemorySink::new());
        let handle = JournalHandle::start(&config, receiver, sink.clone());

        for cmd in ["A", "B", "C"] {
            queue.enqueue(transaction(cmd));
        }

        assert!(sink.wait_for(3, Duration::from_secs(2)).await);
        let commands: Vec<_> = sink.records().iter().map(|t| t.command().to_string()).collect();
        assert_eq!(commands, ["A", "B", "C"]);

        let stats = handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(stats.persisted, 3);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let config = fast_config();
        let (queue, receiver) = TransactionQueue::new(&config);
        let sink = Arc::new(FlakySink {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: MemorySink::new(),
        });
        let handle = JournalHandle::start(&config, receiver, sink.clone());

        queue.enqueue(transaction("ADD_USER"));
        assert!(sink.inner.wait_for(1, Duration::from_secs(2)).await);

        let stats = handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_and_continue() {
        let config = fast_config();
        let (queue, receiver) = TransactionQueue::new(&config);
        // First record fails all 3 attempts, the second succeeds.
        let sink = Arc::new(FlakySink {
            failures: 3,
            calls: AtomicU32::new(0),
            inner: MemorySink::new(),
        });
        let handle = JournalHandle::start(&config, receiver, sink.clone());

        queue.enqueue(transaction("LOST"));
        queue.enqueue(transaction("KEPT"));
        assert!(sink.inner.wait_for(1, Duration::from_secs(2)).await);
        assert_eq!(sink.inner.records()[0].command(), "KEPT");

        let stats = handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.persisted, 1);
    }

    #[tokio::test]
    async fn test_stalled_sink_times_out_and_drops() {
        let config = JournalConfig {
            max_retries: 0,
            attempt_timeout_ms: 20,
            ..fast_config()
        };
        let (queue, receiver) = TransactionQueue::new(&config);
        let handle = JournalHandle::start(&config, receiver, Arc::new(StalledSink));

        queue.enqueue(transaction("A"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = handle.shutdown(Duration::from_millis(200)).await;
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_transactions() {
        let config = JournalConfig {
            workers: 2,
            ..fast_config()
        };
        let (queue, receiver) = TransactionQueue::new(&config);
        let sink = Arc::new(MemorySink::new());

        for i in 0..50 {
            queue.enqueue(transaction(&format!("CMD{}", i)));
        }
        let handle = JournalHandle::start(&config, receiver, sink.clone());
        let stats = handle.shutdown(Duration::from_secs(2)).await;

        assert_eq!(stats.persisted, 50);
        assert_eq!(sink.len(), 50);
        assert!(queue.is_closed());
    }
}
