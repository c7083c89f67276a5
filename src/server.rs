//! Server bootstrap, accept loop and graceful shutdown.
//!
//! [`Server::bind`] builds the process-scoped [`AppState`] once: the command
//! registry from configuration, the shared store with its expiry sweeper, the
//! transaction queue and its journal workers. Every connection task receives
//! clones of the same handles; nothing is reached through globals.
//!
//! Before [`Server::run`] an embedder may install a [`RequestFilter`] per
//! direction ([`Server::with_filter`]) and a hook that runs once the server
//! is ready, before the first connection is accepted ([`Server::on_ready`]).
//!
//! Shutdown runs in a fixed order:
//!
//! 1. stop accepting,
//! 2. signal every live connection through the [`ConnectionTracker`],
//! 3. wait up to the grace period for connections to finish, then abort
//!    the connection tasks that are left, inbound and outbound alike,
//! 4. close the transaction queue and let the workers drain it,
//! 5. stop the expiry sweeper.
//!
//! [`RequestFilter`]: crate::commands::RequestFilter

use crate::commands::{
    builtin, CommandRegistry, ConnectionContext, Direction, FilterRef, HandlerCatalog,
    RegistryError,
};
use crate::config::{AcceptList, ConfigError, FileConfig, ServerConfig};
use crate::connection::{
    ConnectionHandler, ConnectionStats, ConnectionTracker, Dispatcher, StatsSnapshot,
};
use crate::journal::{
    FileSink, JournalHandle, JournalSnapshot, PersistenceSink, SinkError, TransactionQueue,
};
use crate::storage::{start_expiry_sweeper, ExpirySweeper, Session, SessionId, SharedStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept`, e.g. when file descriptors run out.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How often finished connection tasks are collected.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised while starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("command registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("journal: {0}")]
    Journal(#[from] SinkError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// The request filter installed for each direction.
#[derive(Clone, Default)]
pub struct Filters {
    inbound: Option<FilterRef>,
    outbound: Option<FilterRef>,
}

impl Filters {
    pub fn set(&mut self, direction: Direction, filter: FilterRef) {
        match direction {
            Direction::Inbound => self.inbound = Some(filter),
            Direction::Outbound => self.outbound = Some(filter),
        }
    }

    pub fn get(&self, direction: Direction) -> Option<&FilterRef> {
        match direction {
            Direction::Inbound => self.inbound.as_ref(),
            Direction::Outbound => self.outbound.as_ref(),
        }
    }
}

impl std::fmt::Debug for Filters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filters")
            .field("inbound", &self.inbound.as_ref().map(|filter| filter.name()))
            .field("outbound", &self.outbound.as_ref().map(|filter| filter.name()))
            .finish()
    }
}

/// Every running connection task, inbound and outbound.
#[derive(Clone, Default)]
pub struct ConnectionTasks(Arc<Mutex<JoinSet<()>>>);

impl ConnectionTasks {
    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.0.lock().spawn(task);
    }

    /// Collects finished tasks.
    fn reap(&self) {
        let mut tasks = self.0.lock();
        while let Some(result) = tasks.try_join_next() {
            log_task_exit(result);
        }
    }

    /// Tasks spawned and not yet collected.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts every task and waits for them to stop.
    async fn abort_all(&self) {
        let mut tasks = std::mem::take(&mut *self.0.lock());
        tasks.shutdown().await;
    }
}

impl std::fmt::Debug for ConnectionTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTasks").field("len", &self.len()).finish()
    }
}

fn log_task_exit(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("A connection task panicked: {e:?}");
        }
    }
}

/// Process-wide state shared by every connection.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<CommandRegistry>,
    pub store: Arc<SharedStore>,
    pub files: Arc<FileConfig>,
    pub queue: TransactionQueue,
    pub tracker: Arc<ConnectionTracker>,
    pub stats: Arc<ConnectionStats>,
    pub filters: Filters,
    pub accept: Arc<AcceptList>,
    pub tasks: ConnectionTasks,
    pub max_buffer_size: usize,
}

impl AppState {
    /// Registers a connection and returns the future that serves it.
    ///
    /// The connection stays tracked until the returned future completes.
    pub fn connection_task<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        direction: Direction,
    ) -> (SessionId, impl Future<Output = ()> + Send + 'static)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guard = self.tracker.register(peer);
        let id = guard.id();
        let session = Session::new(id, peer);
        let ctx = ConnectionContext::new(
            &session,
            direction,
            Arc::clone(&self.store),
            Arc::clone(&self.files),
        );
        let mut dispatcher = Dispatcher::new(
            direction,
            Arc::clone(&self.registry),
            self.queue.clone(),
            Arc::clone(&self.stats),
        );
        if let Some(filter) = self.filters.get(direction) {
            dispatcher = dispatcher.with_filter(Arc::clone(filter));
        }
        let handler = ConnectionHandler::new(
            stream,
            session,
            ctx,
            dispatcher,
            Arc::clone(&self.stats),
            self.max_buffer_size,
        );
        let close = guard.close_signal();

        let task = async move {
            // Outcome is logged by the handler itself.
            let _ = handler.run(close).await;
            drop(guard);
        };
        (id, task)
    }

    /// Opens a connection to `addr` and serves the messages arriving on it
    /// with the outbound command table.
    pub async fn connect(&self, addr: SocketAddr) -> std::io::Result<SessionId> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (id, task) = self.connection_task(stream, addr, Direction::Outbound);
        self.tasks.spawn(task);
        info!(connection = %id, remote = %addr, "Outbound connection established");
        Ok(id)
    }
}

/// Summary returned once the server has stopped.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Connections still live when shutdown started.
    pub connections_signalled: usize,
    /// Connections that had to be aborted after the grace period.
    pub connections_aborted: usize,
    pub connections: StatsSnapshot,
    pub journal: JournalSnapshot,
}

/// Runs once the listener is bound and the journal started.
pub type ReadyHook = Box<dyn FnOnce(&AppState) + Send>;

/// A bound server, ready to run.
pub struct Server {
    listener: TcpListener,
    state: AppState,
    journal: JournalHandle,
    sweeper: ExpirySweeper,
    grace: Duration,
    on_ready: Option<ReadyHook>,
}

impl Server {
    /// Binds with the built-in handler catalog and a file journal.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let sink = FileSink::open(&config.journal.path).await?;
        info!(path = %sink.path().display(), "Journal file opened");
        Self::bind_with(config, &builtin::catalog(), Arc::new(sink)).await
    }

    /// Binds with an explicit handler catalog and persistence sink.
    pub async fn bind_with(
        config: ServerConfig,
        catalog: &HandlerCatalog,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let registry =
            CommandRegistry::bootstrap(catalog, &config.inbound_commands(), &config.outbound)?;

        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        if !config.accept.is_open() {
            info!(accept = ?config.accept, "Accepting listed peers only");
        }

        let store = Arc::new(SharedStore::with_default_ttl(config.store.default_ttl()));
        let sweeper = start_expiry_sweeper(Arc::clone(&store));
        let (queue, receiver) = TransactionQueue::new(&config.journal);
        let journal = JournalHandle::start(&config.journal, receiver, sink);

        let state = AppState {
            registry: Arc::new(registry),
            store,
            files: Arc::new(config.files.clone()),
            queue,
            tracker: Arc::new(ConnectionTracker::new()),
            stats: Arc::new(ConnectionStats::new()),
            filters: Filters::default(),
            accept: Arc::new(config.accept.clone()),
            tasks: ConnectionTasks::default(),
            max_buffer_size: config.max_buffer_size,
        };

        Ok(Self {
            listener,
            state,
            journal,
            sweeper,
            grace: config.shutdown_grace(),
            on_ready: None,
        })
    }

    /// Installs the filter for every request arriving in `direction`.
    pub fn with_filter(mut self, direction: Direction, filter: FilterRef) -> Self {
        info!(direction = %direction, filter = filter.name(), "Request filter installed");
        self.state.filters.set(direction, filter);
        self
    }

    /// Sets the hook [`run`](Self::run) calls before accepting connections.
    pub fn on_ready(mut self, hook: impl FnOnce(&AppState) + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Accepts connections until `shutdown` completes, then shuts down.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ShutdownReport {
        let Server {
            listener,
            state,
            journal,
            sweeper,
            grace,
            on_ready,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Listening");
        }
        if let Some(hook) = on_ready {
            hook(&state);
            debug!("Ready hook completed");
        }

        let mut reap = tokio::time::interval(REAP_INTERVAL);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }

                res = listener.accept() => match res {
                    Ok((stream, addr)) if !state.accept.allows(addr.ip()) => {
                        state.stats.connection_refused();
                        warn!(client = %addr, "Connection refused, peer not in accept list");
                        drop(stream);
                    }
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let (_, task) = state.connection_task(stream, addr, Direction::Inbound);
                        state.tasks.spawn(task);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                _ = reap.tick() => state.tasks.reap(),
            }
        }

        drop(listener);

        let connections_signalled = state.tracker.close_all();
        info!(connections = connections_signalled, "Closing client connections");
        let connections_aborted = if state.tracker.wait_idle(grace).await {
            0
        } else {
            let remaining = state.tracker.len();
            warn!(remaining, "Connections still open after grace period, aborting");
            remaining
        };
        state.tasks.abort_all().await;

        let journal = journal.shutdown(grace).await;
        sweeper.shutdown().await;

        let report = ShutdownReport {
            connections_signalled,
            connections_aborted,
            connections: state.stats.snapshot(),
            journal,
        };
        info!(
            requests = report.connections.requests_processed,
            persisted = report.journal.persisted,
            failed = report.journal.failed,
            "Server shutdown complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandBinding, HandlerError, RequestFilter};
    use crate::journal::MemorySink;
    use crate::protocol::{parse_frame, Frame, Payload, Request, ResultCode, Value};
    use crate::storage::Session;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    struct Running {
        addr: SocketAddr,
        state: AppState,
        sink: Arc<MemorySink>,
        stop: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<ShutdownReport>,
        _dir: tempfile::TempDir,
    }

    async fn start(outbound: Vec<CommandBinding>) -> Running {
        start_with(
            ServerConfig {
                outbound,
                ..ServerConfig::default()
            },
            |server| server,
        )
        .await
    }

    async fn start_with(config: ServerConfig, prepare: impl FnOnce(Server) -> Server) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            port: 0,
            shutdown_grace_ms: 1000,
            files: FileConfig {
                data_dir: dir.path().to_path_buf(),
                placeholder_image: None,
            },
            ..config
        };
        let sink = Arc::new(MemorySink::new());
        let server = Server::bind_with(config, &builtin::catalog(), Arc::clone(&sink) as Arc<dyn PersistenceSink>)
            .await
            .unwrap();
        let server = prepare(server);
        let addr = server.local_addr().unwrap();
        let state = server.state().clone();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        Running {
            addr,
            state,
            sink,
            stop,
            task,
            _dir: dir,
        }
    }

    struct Client {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self::over(TcpStream::connect(addr).await.unwrap())
        }

        fn over(stream: TcpStream) -> Self {
            Self {
                stream,
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, request: &Request) {
            self.stream
                .write_all(&request.to_frame().serialize())
                .await
                .unwrap();
        }

        async fn read(&mut self) -> Frame {
            loop {
                if let Some((frame, consumed)) = parse_frame(&self.buf).unwrap() {
                    let _ = self.buf.split_to(consumed);
                    return frame;
                }
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read_buf(&mut self.buf))
                    .await
                    .expect("timed out waiting for a frame")
                    .unwrap();
                assert!(n > 0, "connection closed");
            }
        }

        async fn call(&mut self, request: Request) -> Frame {
            self.send(&request).await;
            self.read().await
        }
    }

    #[tokio::test]
    async fn test_add_user_is_answered_and_journaled() {
        let server = start(Vec::new()).await;
        let mut client = Client::connect(server.addr).await;

        let reply = client
            .call(Request::new("ADD_USER").with("username", "alice").with("password", "x"))
            .await;
        assert_eq!(reply.as_map(), Some(&Payload::new()));

        assert!(server.sink.wait_for(1, Duration::from_secs(2)).await);
        let record = &server.sink.records()[0];
        assert_eq!(record.command(), "ADD_USER");
        assert_eq!(record.outcome.code, ResultCode::Success);
        assert_eq!(record.request.get_str("result-code"), Some("000"));
        assert!(record.request.get("password").is_none());

        server.stop.send(()).unwrap();
        let report = server.task.await.unwrap();
        assert_eq!(report.journal.persisted, 1);
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_and_is_journaled() {
        let server = start(Vec::new()).await;
        let mut client = Client::connect(server.addr).await;

        let reply = client.call(Request::new("UNKNOWN_CMD")).await;
        assert_eq!(reply.as_map(), Some(&Payload::new()));

        let reply = client.call(Request::new("PING")).await;
        assert_eq!(reply.as_map().unwrap()["pong"], Value::text("PONG"));

        assert!(server.sink.wait_for(2, Duration::from_secs(2)).await);
        let codes: Vec<_> = server.sink.records().iter().map(|tx| tx.outcome.code).collect();
        assert_eq!(codes, [ResultCode::UnknownCommand, ResultCode::Success]);
    }

    #[tokio::test]
    async fn test_captcha_sessions_are_isolated() {
        let server = start(Vec::new()).await;
        let mut a = Client::connect(server.addr).await;
        let mut b = Client::connect(server.addr).await;

        let challenge_a = a.call(Request::new("GET_CAPTCHA")).await.as_map().unwrap()["data"].clone();
        let challenge_b = b.call(Request::new("GET_CAPTCHA")).await.as_map().unwrap()["data"].clone();

        let verify = |challenge: Value| Request::new("VERIFY_CAPTCHA").with("answer", challenge);
        let reply_a = a.call(verify(challenge_a)).await;
        let reply_b = b.call(verify(challenge_b)).await;

        assert_eq!(reply_a.as_map().unwrap()["verified"], Value::text("true"));
        assert_eq!(reply_b.as_map().unwrap()["verified"], Value::text("true"));
    }

    #[tokio::test]
    async fn test_connections_are_tracked_and_closable() {
        let server = start(Vec::new()).await;
        let mut client = Client::connect(server.addr).await;
        client.call(Request::new("PING")).await;

        let live = server.state.tracker.connections();
        assert_eq!(live.len(), 1);
        assert!(server.state.tracker.close(SessionId(live[0].id)));

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(server.state.tracker.wait_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_clients() {
        let server = start(Vec::new()).await;
        let mut client = Client::connect(server.addr).await;
        client.call(Request::new("PING")).await;

        server.stop.send(()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(3), server.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.connections_signalled, 1);
        assert_eq!(report.connections_aborted, 0);
        assert_eq!(report.connections.active_connections, 0);
        assert!(server.state.queue.is_closed());

        let mut rest = Vec::new();
        assert_eq!(client.stream.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outbound_connection_uses_outbound_table() {
        let server = start(vec![CommandBinding::new("NOTIFY", "system.ping")]).await;
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        server.state.connect(remote_addr).await.unwrap();
        let (stream, _) = remote.accept().await.unwrap();
        let mut peer = Client::over(stream);

        let reply = peer.call(Request::new("NOTIFY").with("message", "hello")).await;
        assert_eq!(reply.as_map().unwrap()["pong"], Value::text("hello"));

        // Inbound-only commands are unknown on outbound connections.
        let reply = peer.call(Request::new("PING")).await;
        assert_eq!(reply.as_map(), Some(&Payload::new()));
    }

    #[tokio::test]
    async fn test_bind_rejects_unknown_handler() {
        let config = ServerConfig {
            port: 0,
            inbound: Some(vec![CommandBinding::new("X", "no.such.handler")]),
            ..ServerConfig::default()
        };
        let result = Server::bind_with(config, &builtin::catalog(), Arc::new(MemorySink::new())).await;
        assert!(matches!(
            result,
            Err(ServerError::Registry(RegistryError::UnknownHandler { .. }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_collects_outbound_connections() {
        let server = start(Vec::new()).await;
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        server.state.connect(remote_addr).await.unwrap();
        let (mut stream, _) = remote.accept().await.unwrap();
        assert_eq!(server.state.tasks.len(), 1);

        server.stop.send(()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(3), server.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.connections_signalled, 1);
        assert_eq!(report.connections_aborted, 0);
        assert!(server.state.tasks.is_empty());

        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_outside_accept_list_is_refused() {
        let config = ServerConfig {
            accept: AcceptList::new(["192.0.2.10".parse::<std::net::IpAddr>().unwrap()]),
            ..ServerConfig::default()
        };
        let server = start_with(config, |server| server).await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(server.state.stats.snapshot().connections_refused, 1);
        assert_eq!(server.state.stats.snapshot().connections_accepted, 0);
        assert!(server.state.tracker.is_empty());
    }

    /// Refuses every inbound request that lacks a `token` field.
    struct RequireToken;

    #[async_trait]
    impl RequestFilter for RequireToken {
        async fn filter(
            &self,
            request: &mut Request,
            _session: &mut Session,
            _ctx: &ConnectionContext,
        ) -> Result<(), HandlerError> {
            match request.remove("token") {
                Some(_) => Ok(()),
                None => Err(HandlerError::rejected("auth_01", "token required")),
            }
        }

        fn name(&self) -> &'static str {
            "test.require_token"
        }
    }

    #[tokio::test]
    async fn test_inbound_filter_applies_to_accepted_connections() {
        let server = start_with(ServerConfig::default(), |server| {
            server.with_filter(Direction::Inbound, Arc::new(RequireToken))
        })
        .await;
        let mut client = Client::connect(server.addr).await;

        let refused = client.call(Request::new("PING")).await;
        assert_eq!(refused.as_map().unwrap()["error_code"], Value::text("auth_01"));

        let reply = client.call(Request::new("PING").with("token", "t")).await;
        assert_eq!(reply.as_map().unwrap()["pong"], Value::text("PONG"));

        assert!(server.sink.wait_for(2, Duration::from_secs(2)).await);
        let records = server.sink.records();
        assert_eq!(records[0].outcome.code, ResultCode::Failure);
        assert_eq!(records[1].outcome.code, ResultCode::Success);
        assert!(records[1].request.get("token").is_none());
    }

    #[tokio::test]
    async fn test_ready_hook_runs_before_first_connection() {
        let (ready_tx, ready_rx) = oneshot::channel();
        let server = start_with(ServerConfig::default(), move |server| {
            server.on_ready(move |state| {
                state.store.set("boot", "ready", "1");
                let _ = ready_tx.send(state.tracker.len());
            })
        })
        .await;

        let live_at_ready = tokio::time::timeout(Duration::from_secs(2), ready_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live_at_ready, 0);
        assert!(server.state.store.get("boot", "ready").is_some());

        let mut client = Client::connect(server.addr).await;
        client.call(Request::new("PING")).await;
    }
}
