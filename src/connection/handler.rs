//! Connection Handler Module
//!
//! This module drives one client connection. Each connection runs in its own
//! task, owns its [`Session`], and processes one request at a time, so
//! responses go out in request order.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! CONNECTED
//!     │
//!     ▼
//! ┌────────────────────────────────────────────────┐
//! │  DECODING ──> DISPATCHING ──> RESPONDING ──┐   │
//! │     ▲                                      │   │
//! │     └──────────────────────────────────────┘   │
//! │                                                │
//! │  malformed input: error frame, stay connected  │
//! │  unknown command: empty map, stay connected    │
//! │  handler fault:   error map, stay connected    │
//! └────────────────────────────────────────────────┘
//!     │ peer hangs up / close signal / write fails
//!     ▼
//!   CLOSED (session dropped)
//! ```
//!
//! ## Buffer Management
//!
//! Incoming bytes accumulate in a `BytesMut`. A read may hold half a frame
//! or several frames; every complete frame is handled before reading again.
//! When framing is broken there is no reliable resync point, so the whole
//! buffer is discarded and the client gets one error frame.
//!
//! A frame that outgrows `max_buffer_size` is rejected with an error frame
//! and the rest of it is skipped by walking its headers as it arrives, so no
//! part of its body is ever read as a new message. If its framing breaks
//! while skipping, the connection is closed.

use crate::commands::{error_payload, ConnectionContext, Reply, INTERNAL_ERROR_CODE};
use crate::connection::Dispatcher;
use crate::protocol::types::{raw_header, CRLF};
use crate::protocol::{Frame, FrameParser, FrameSkipper, Request, Skipped};
use crate::storage::Session;
use bytes::BytesMut;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Connections dropped because the peer is not in the accept list
    pub connections_refused: AtomicU64,
    /// Requests dispatched, including unknown commands
    pub requests_processed: AtomicU64,
    /// Messages that could not be decoded
    pub malformed_messages: AtomicU64,
    pub unknown_commands: AtomicU64,
    /// Handler errors and panics
    pub handler_faults: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

/// Plain copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub connections_refused: u64,
    pub requests_processed: u64,
    pub malformed_messages: u64,
    pub unknown_commands: u64,
    pub handler_faults: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_processed(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_command(&self) {
        self.unknown_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            unknown_commands: self.unknown_commands.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// One step of the decode stage.
enum Decoded {
    Request(Request),
    /// Undecodable input. The connection answers with an error frame.
    Malformed(String),
    /// Input that cannot be resynchronised. The connection answers with an
    /// error frame, then closes.
    Fatal(String),
}

/// Handles a single client connection.
///
/// Generic over the stream so tests can drive it with in-memory pipes.
pub struct ConnectionHandler<S> {
    /// The stream for this connection
    stream: BufWriter<S>,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// Upper bound for `buffer`
    max_buffer_size: usize,

    /// Frame parser
    parser: FrameParser,

    /// Set while the tail of an oversized frame is being discarded
    skipping: Option<FrameSkipper>,

    /// This connection's attribute bag
    session: Session,

    /// Process state handed to handlers
    ctx: ConnectionContext,

    dispatcher: Dispatcher,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The byte stream for this connection
    /// * `session` - The session created for this connection
    /// * `ctx` - Process state visible to handlers
    /// * `dispatcher` - Routes requests to handlers
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: S,
        session: Session,
        ctx: ConnectionContext,
        dispatcher: Dispatcher,
        stats: Arc<ConnectionStats>,
        max_buffer_size: usize,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            max_buffer_size,
            parser: FrameParser::new(),
            skipping: None,
            session,
            ctx,
            dispatcher,
            stats,
        }
    }

    /// Runs the connection until the peer disconnects, a write fails, or
    /// `close` flips to `true`.
    pub async fn run(mut self, mut close: watch::Receiver<bool>) -> Result<(), ConnectionError> {
        let client = self.session.peer();
        let session_id = self.session.id();
        info!(client = %client, session = %session_id, "Client connected");

        let result = self.main_loop(&mut close).await;

        match &result {
            Ok(()) => info!(client = %client, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %client, "Client disconnected")
                }
                ConnectionError::Closed => {
                    info!(client = %client, "Connection closed by server")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %client, "Connection reset by client")
                }
                _ => warn!(client = %client, error = %e, "Connection error"),
            },
        }

        debug!(
            session = %session_id,
            attributes = self.session.attribute_count(),
            age_ms = self.session.created_at().elapsed().as_millis() as u64,
            "Session destroyed"
        );
        self.stats.connection_closed();
        result
    }

    /// The main decode-dispatch-respond loop.
    async fn main_loop(&mut self, close: &mut watch::Receiver<bool>) -> Result<(), ConnectionError> {
        loop {
            while let Some(decoded) = self.try_decode() {
                match decoded {
                    Decoded::Request(request) => {
                        let command = request.command().to_string();
                        let Some(dispatched) = self
                            .dispatcher
                            .dispatch_until(request, &mut self.session, &self.ctx, wait_closed(close))
                            .await
                        else {
                            return Err(ConnectionError::Closed);
                        };
                        trace!(
                            client = %self.ctx.peer,
                            command = %command,
                            code = %dispatched.outcome.code,
                            "Dispatched"
                        );
                        self.write_with_close(close, Outgoing::Reply(dispatched.reply))
                            .await?;
                    }
                    Decoded::Malformed(message) => {
                        self.write_with_close(close, Outgoing::Error(message)).await?;
                    }
                    Decoded::Fatal(message) => {
                        self.write_with_close(close, Outgoing::Error(message.clone())).await?;
                        return Err(ConnectionError::Framing(message));
                    }
                }
            }

            if *close.borrow() {
                return Err(ConnectionError::Closed);
            }

            tokio::select! {
                biased;
                changed = close.changed() => {
                    if changed.is_err() || *close.borrow() {
                        return Err(ConnectionError::Closed);
                    }
                }
                read = self.read_more_data() => read?,
            }
        }
    }

    /// Attempts to decode one message from the buffer.
    fn try_decode(&mut self) -> Option<Decoded> {
        if self.skipping.is_some() {
            if let Some(fatal) = self.skip_oversized() {
                return Some(fatal);
            }
            if self.skipping.is_some() {
                return None;
            }
        }

        if self.buffer.is_empty() {
            return None;
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((frame, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.ctx.peer,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed frame"
                );
                match Request::from_frame(frame) {
                    Ok(request) => Some(Decoded::Request(request)),
                    Err(e) => {
                        self.stats.malformed_message();
                        debug!(client = %self.ctx.peer, error = %e, "Invalid request");
                        Some(Decoded::Malformed(format!("ERR malformed message: {}", e)))
                    }
                }
            }
            Ok(None) => {
                if self.buffer.len() >= self.max_buffer_size {
                    self.stats.malformed_message();
                    warn!(
                        client = %self.ctx.peer,
                        size = self.buffer.len(),
                        "Buffer size limit exceeded, discarding frame"
                    );
                    self.skipping = Some(FrameSkipper::new());
                    if let Some(fatal) = self.skip_oversized() {
                        return Some(fatal);
                    }
                    return Some(Decoded::Malformed(format!(
                        "ERR message exceeds {} bytes",
                        self.max_buffer_size
                    )));
                }
                trace!(
                    client = %self.ctx.peer,
                    buffered = self.buffer.len(),
                    "Incomplete frame, need more data"
                );
                None
            }
            Err(e) => {
                let discarded = self.buffer.len();
                self.buffer.clear();
                self.stats.malformed_message();
                warn!(client = %self.ctx.peer, error = %e, discarded, "Parse error, input discarded");
                Some(Decoded::Malformed(format!("ERR malformed message: {}", e)))
            }
        }
    }

    /// Drops buffered bytes that belong to the oversized frame. Clears
    /// `skipping` once the frame has ended.
    fn skip_oversized(&mut self) -> Option<Decoded> {
        let skipper = self.skipping.as_mut()?;
        match skipper.skip(&self.buffer) {
            Ok(Skipped::Done(consumed)) => {
                let _ = self.buffer.split_to(consumed);
                debug!(
                    client = %self.ctx.peer,
                    skipped = skipper.skipped(),
                    "Oversized frame discarded"
                );
                self.skipping = None;
                None
            }
            Ok(Skipped::Partial(consumed)) => {
                let _ = self.buffer.split_to(consumed);
                None
            }
            Err(e) => {
                self.skipping = None;
                self.buffer.clear();
                warn!(client = %self.ctx.peer, error = %e, "Lost framing while discarding oversized frame");
                Some(Decoded::Fatal(format!("ERR malformed message: {}", e)))
            }
        }
    }

    /// Reads more data from the stream into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        // Ensure we have some capacity
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.ctx.peer, bytes = n, "Read data");

        Ok(())
    }

    /// Writes a response, giving up if the connection is asked to close
    /// while the peer is not reading.
    async fn write_with_close(
        &mut self,
        close: &mut watch::Receiver<bool>,
        outgoing: Outgoing,
    ) -> Result<(), ConnectionError> {
        let write = async {
            let written = self.write_outgoing(outgoing).await?;
            self.stream.flush().await?;
            Ok::<usize, std::io::Error>(written)
        };

        let written = tokio::select! {
            written = write => written,
            _ = wait_closed(close) => return Err(ConnectionError::Closed),
        };

        match written {
            Ok(bytes) => {
                self.stats.bytes_written(bytes);
                trace!(client = %self.ctx.peer, bytes, "Sent response");
                Ok(())
            }
            Err(e) => {
                // The transaction is already journaled; only the reply is lost.
                debug!(client = %self.ctx.peer, error = %e, "Response discarded, connection not writable");
                Err(ConnectionError::IoError(e))
            }
        }
    }

    async fn write_outgoing(&mut self, outgoing: Outgoing) -> std::io::Result<usize> {
        match outgoing {
            Outgoing::Error(message) => self.write_frame(&Frame::error(message)).await,
            Outgoing::Reply(Reply::Data(map)) => self.write_frame(&Frame::map(map)).await,
            Outgoing::Reply(Reply::Raw(bytes)) => self.write_frame(&Frame::Raw(bytes)).await,
            Outgoing::Reply(Reply::File(path)) => match self.write_file(&path).await {
                Ok(n) => Ok(n),
                Err(FileError::Open(e)) => {
                    warn!(client = %self.ctx.peer, path = %path.display(), error = %e, "File vanished before streaming");
                    let payload = error_payload(INTERNAL_ERROR_CODE, "file unavailable");
                    self.write_frame(&Frame::map(payload)).await
                }
                Err(FileError::Stream(e)) => Err(e),
            },
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<usize> {
        let bytes = frame.serialize();
        self.stream.write_all(&bytes).await?;
        Ok(bytes.len())
    }

    /// Streams a file as a raw frame without loading it into memory.
    async fn write_file(&mut self, path: &Path) -> Result<usize, FileError> {
        let file = tokio::fs::File::open(path).await.map_err(FileError::Open)?;
        let len = file.metadata().await.map_err(FileError::Open)?.len();

        let header = raw_header(len);
        self.stream.write_all(&header).await.map_err(FileError::Stream)?;
        let copied = tokio::io::copy(&mut file.take(len), &mut self.stream)
            .await
            .map_err(FileError::Stream)?;
        if copied != len {
            return Err(FileError::Stream(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shrank while streaming",
            )));
        }
        self.stream.write_all(CRLF).await.map_err(FileError::Stream)?;

        Ok(header.len() + len as usize + CRLF.len())
    }
}

enum Outgoing {
    Reply(Reply),
    Error(String),
}

enum FileError {
    /// Nothing was written yet.
    Open(std::io::Error),
    /// The raw frame is partially written; the stream is unusable.
    Stream(std::io::Error),
}

async fn wait_closed(close: &mut watch::Receiver<bool>) {
    loop {
        if *close.borrow() {
            return;
        }
        if close.changed().await.is_err() {
            return;
        }
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial message)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Closed through the connection tracker
    #[error("Connection closed by server")]
    Closed,

    /// Input framing could not be recovered
    #[error("Unrecoverable framing error: {0}")]
    Framing(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{
        builtin, CommandBinding, CommandRegistry, Direction, Handler, HandlerError, HandlerRef,
    };
    use crate::config::FileConfig;
    use crate::journal::{JournalConfig, TransactionQueue, TransactionReceiver};
    use crate::protocol::{parse_frame, Payload, ResultCode, Value};
    use async_trait::async_trait;
    use bytes::Bytes;
    use crate::storage::{SessionId, SharedStore};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    /// Never finishes.
    struct Stalling;

    #[async_trait]
    impl Handler for Stalling {
        async fn process(
            &self,
            _request: &mut Request,
            _session: &mut Session,
            _ctx: &ConnectionContext,
        ) -> Result<Reply, HandlerError> {
            std::future::pending::<()>().await;
            Ok(Reply::empty())
        }

        fn name(&self) -> &'static str {
            "test.stall"
        }
    }

    struct Harness {
        client: DuplexStream,
        close_tx: watch::Sender<bool>,
        receiver: TransactionReceiver,
        stats: Arc<ConnectionStats>,
        task: tokio::task::JoinHandle<Result<(), ConnectionError>>,
    }

    fn start_with(files: FileConfig) -> Harness {
        let registry = CommandRegistry::bootstrap(
            &builtin::catalog().with("test.stall", || Arc::new(Stalling) as HandlerRef),
            &[
                CommandBinding::new("PING", "system.ping"),
                CommandBinding::new("ADD_USER", "user.create"),
                CommandBinding::new("DELETE_USER", "user.delete"),
                CommandBinding::new("GET_CAPTCHA", "captcha.issue"),
                CommandBinding::new("UPLOAD_USER_PIC", "file.upload"),
                CommandBinding::new("VIEW_USER_IMAGE", "file.view"),
                CommandBinding::new("STALL", "test.stall"),
            ],
            &[],
        )
        .unwrap();
        let (queue, receiver) = TransactionQueue::new(&JournalConfig::default());
        let stats = Arc::new(ConnectionStats::new());
        let dispatcher = Dispatcher::new(
            Direction::Inbound,
            Arc::new(registry),
            queue,
            Arc::clone(&stats),
        );

        let (client, server) = duplex(64 * 1024);
        let session = Session::new(SessionId(1), "127.0.0.1:7000".parse().unwrap());
        let ctx = ConnectionContext::new(
            &session,
            Direction::Inbound,
            Arc::new(SharedStore::new()),
            Arc::new(files),
        );
        let (close_tx, close_rx) = watch::channel(false);
        let handler = ConnectionHandler::new(server, session, ctx, dispatcher, Arc::clone(&stats), 1024 * 1024);
        let task = tokio::spawn(handler.run(close_rx));

        Harness {
            client,
            close_tx,
            receiver,
            stats,
            task,
        }
    }

    fn start() -> Harness {
        start_with(FileConfig::default())
    }

    fn request(command: &str, fields: &[(&str, &str)]) -> Vec<u8> {
        let mut req = Request::new(command);
        for (k, v) in fields {
            req.insert(*k, *v);
        }
        req.to_frame().serialize()
    }

    impl Harness {
        async fn send(&mut self, bytes: &[u8]) {
            self.client.write_all(bytes).await.unwrap();
        }

        /// Reads until one complete frame is buffered.
        async fn read_frame(&mut self) -> Frame {
            let mut buf = BytesMut::new();
            loop {
                if let Some((frame, _)) = parse_frame(&buf).unwrap() {
                    return frame;
                }
                let n = tokio::time::timeout(Duration::from_secs(2), self.client.read_buf(&mut buf))
                    .await
                    .expect("timed out waiting for a response")
                    .unwrap();
                assert!(n > 0, "connection closed");
            }
        }
    }

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let mut h = start();
        h.send(&request("PING", &[])).await;
        let frame = h.read_frame().await;
        assert_eq!(frame.as_map().unwrap()["pong"], Value::text("PONG"));
    }

    #[tokio::test]
    async fn test_add_user_scenario() {
        let mut h = start();
        h.send(&request("ADD_USER", &[("username", "alice"), ("password", "x")])).await;

        let frame = h.read_frame().await;
        assert_eq!(frame.as_map(), Some(&Payload::new()));

        let tx = h.receiver.recv().await.unwrap();
        assert_eq!(tx.outcome.code, ResultCode::Success);
        assert_eq!(tx.request.get_str("result-code"), Some("000"));
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_open() {
        let mut h = start();
        h.send(&request("UNKNOWN_CMD", &[])).await;
        assert_eq!(h.read_frame().await.as_map(), Some(&Payload::new()));

        let tx = h.receiver.recv().await.unwrap();
        assert_eq!(tx.command(), "UNKNOWN_CMD");

        h.send(&request("PING", &[])).await;
        assert!(h.read_frame().await.as_map().unwrap().contains_key("pong"));
    }

    #[tokio::test]
    async fn test_malformed_frame_then_recovery() {
        let mut h = start();
        h.send(b"$abc\r\n").await;
        assert!(h.read_frame().await.is_error());

        // Valid frame that is not a request: only its bytes are consumed.
        h.send(b"+hello\r\n").await;
        assert!(h.read_frame().await.is_error());

        h.send(&request("PING", &[])).await;
        assert!(h.read_frame().await.as_map().is_some());
        assert_eq!(h.stats.snapshot().malformed_messages, 2);
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let mut h = start();
        let mut batch = request("PING", &[("message", "one")]);
        batch.extend(request("PING", &[("message", "two")]));
        batch.extend(b"PING message=three\r\n");
        h.send(&batch).await;

        for expected in ["one", "two", "three"] {
            let frame = h.read_frame_exact().await;
            assert_eq!(frame.as_map().unwrap()["pong"], Value::text(expected));
        }
    }

    #[tokio::test]
    async fn test_file_reply_is_raw_frame() {
        let dir = tempfile::tempdir().unwrap();
        let placeholder = dir.path().join("no-image.jpg");
        std::fs::write(&placeholder, b"JPEGDATA").unwrap();
        let mut h = start_with(FileConfig {
            data_dir: dir.path().to_path_buf(),
            placeholder_image: Some(placeholder),
        });

        h.send(&request("VIEW_USER_IMAGE", &[("filename", "1_x.jpg")])).await;
        match h.read_frame().await {
            Frame::Raw(bytes) => assert_eq!(&bytes[..], b"JPEGDATA"),
            other => panic!("expected raw frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_signal_ends_idle_connection() {
        let h = start();
        h.close_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert_eq!(h.stats.snapshot().active_connections, 0);
    }

    #[tokio::test]
    async fn test_client_hangup() {
        let h = start();
        drop(h.client);
        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_scripted_exchange_with_mock_io() {
        let registry = CommandRegistry::bootstrap(
            &builtin::catalog(),
            &[CommandBinding::new("PING", "system.ping")],
            &[],
        )
        .unwrap();
        let (queue, _receiver) = TransactionQueue::new(&JournalConfig::default());
        let stats = Arc::new(ConnectionStats::new());
        let dispatcher = Dispatcher::new(Direction::Inbound, Arc::new(registry), queue, Arc::clone(&stats));
        let session = Session::new(SessionId(9), "127.0.0.1:7001".parse().unwrap());
        let ctx = ConnectionContext::new(
            &session,
            Direction::Inbound,
            Arc::new(SharedStore::new()),
            Arc::new(FileConfig::default()),
        );

        let mut pong = Payload::new();
        pong.insert("pong".to_string(), Value::text("hi"));
        let mock = tokio_test::io::Builder::new()
            .read(b"PING message=hi\r\n")
            .write(&Frame::map(pong).serialize())
            .build();

        let (_close_tx, close_rx) = watch::channel(false);
        let handler = ConnectionHandler::new(mock, session, ctx, dispatcher, Arc::clone(&stats), 1024);
        let result = handler.run(close_rx).await;

        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_processed, 1);
        assert_eq!(snapshot.bytes_read, 17);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[tokio::test]
    async fn test_oversized_input_discarded() {
        let mut h = start();
        // An unterminated inline line never completes a frame.
        h.send(&vec![b'x'; 1024 * 1024]).await;
        assert!(h.read_frame().await.is_error());

        // The rest of the line is discarded up to its CRLF.
        h.send(b"xxxx\r\nPING\r\n").await;
        assert!(h.read_frame().await.as_map().is_some());
        assert_eq!(h.stats.snapshot().malformed_messages, 1);
    }

    #[tokio::test]
    async fn test_oversized_blob_body_is_never_executed() {
        let mut h = start();
        let mut blob = vec![b'x'; 1024 * 1024];
        blob.extend_from_slice(b"\r\nDELETE_USER userid=1\r\n");
        blob.extend_from_slice(&[b'y'; 4096]);
        let upload = Request::new("UPLOAD_USER_PIC")
            .with("filename", "me.png")
            .with("file", Bytes::from(blob))
            .to_frame()
            .serialize();

        h.send(&upload).await;
        h.send(&request("PING", &[])).await;

        assert!(h.read_frame_exact().await.is_error());
        let pong = h.read_frame_exact().await;
        assert_eq!(pong.as_map().unwrap()["pong"], Value::text("PONG"));

        // Only PING reached the dispatcher.
        let tx = h.receiver.recv().await.unwrap();
        assert_eq!(tx.command(), "PING");
        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.requests_processed, 1);
        assert_eq!(snapshot.malformed_messages, 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_with_broken_framing_closes() {
        let mut h = start();
        // A blob header that never terminates inside a list.
        let mut input = b"*2\r\n$".to_vec();
        input.extend(vec![b'9'; 1024 * 1024]);
        h.send(&input).await;

        assert!(h.read_frame_exact().await.is_error());
        let result = tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Framing(_))));
    }

    #[tokio::test]
    async fn test_close_signal_ends_stalled_request() {
        let mut h = start();
        h.send(b"STALL\r\n").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.close_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("a stalled handler must not hold the connection open")
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));

        let tx = h.receiver.recv().await.unwrap();
        assert_eq!(tx.command(), "STALL");
        assert_eq!(tx.outcome.code, ResultCode::HandlerFault);
        assert_eq!(tx.request.get_str("result-code"), Some("003"));
    }

    impl Harness {
        /// Reads exactly one frame, keeping any following bytes for the next call.
        async fn read_frame_exact(&mut self) -> Frame {
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                if let Some((frame, consumed)) = parse_frame(&buf).unwrap() {
                    assert_eq!(consumed, buf.len());
                    return frame;
                }
                tokio::time::timeout(Duration::from_secs(2), self.client.read_exact(&mut byte))
                    .await
                    .expect("timed out waiting for a response")
                    .unwrap();
                buf.push(byte[0]);
            }
        }
    }
}
