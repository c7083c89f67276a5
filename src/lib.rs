//! # Switchboard - A Persistent-Connection Command Server
//!
//! Switchboard accepts long-lived client connections, decodes a stream of
//! command messages from each, routes every message to a handler chosen by
//! its command code, writes the handler's response back on the same
//! connection, and hands a record of each completed request to a background
//! journal.
//!
//! ## Features
//!
//! - **Pluggable handlers**: command codes map to handler identifiers in configuration
//! - **Per-connection sessions**: attribute bags that never leak across connections
//! - **Shared store**: namespaced process-wide cache with optional TTL
//! - **Async journal**: request latency never waits on persistence
//! - **Fault isolation**: a failing or panicking handler never takes the connection down
//! - **Request filters**: an optional pre-dispatch hook per direction
//! - **Accept list**: restrict which peer addresses may connect
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             Switchboard                                 │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│ Dispatcher  │──> Handler       │
//! │  │ (Listener)  │    │  Handler    │    │             │                  │
//! │  └──────┬──────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │         │                  │ Session          │ enqueue                 │
//! │         ▼                  ▼                  ▼                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐            │
//! │  │ Connection  │    │ SharedStore │    │ TransactionQueue │            │
//! │  │  Tracker    │    │ (64 shards) │    └────────┬─────────┘            │
//! │  └─────────────┘    └──────▲──────┘             │                      │
//! │                            │                    ▼                      │
//! │                     ┌──────┴──────┐    ┌──────────────────┐            │
//! │                     │ExpirySweeper│    │ JournalWorker(s) │──> Sink    │
//! │                     └─────────────┘    └──────────────────┘            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use switchboard::config::ServerConfig;
//! use switchboard::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     server.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Built-in Commands
//!
//! | Command           | Handler          |
//! |-------------------|------------------|
//! | `PING`            | `system.ping`    |
//! | `ADD_USER`        | `user.create`    |
//! | `UPDATE_USER`     | `user.update`    |
//! | `DELETE_USER`     | `user.delete`    |
//! | `LOAD_VIEW_USER`  | `user.view`      |
//! | `GET_CAPTCHA`     | `captcha.issue`  |
//! | `VERIFY_CAPTCHA`  | `captcha.verify` |
//! | `UPLOAD_USER_PIC` | `file.upload`    |
//! | `VIEW_USER_IMAGE` | `file.view`      |
//!
//! ## Module Overview
//!
//! - [`protocol`]: Wire frames, incremental parser and the typed `Request`
//! - [`commands`]: Handler trait, catalog, registry and built-in handlers
//! - [`connection`]: Per-connection loop, dispatcher and connection tracker
//! - [`storage`]: Sessions, the shared store and its expiry sweeper
//! - [`journal`]: Transaction queue, workers and persistence sinks
//! - [`config`]: TOML configuration and legacy process lists
//! - [`server`]: Bootstrap, accept loop and graceful shutdown
//!
//! ## Design Highlights
//!
//! ### Immutable Registry
//!
//! The command table is built once at bootstrap and shared through `Arc`.
//! Dispatch is a plain map lookup with no locking.
//!
//! ### Fire-and-Continue Journal
//!
//! `enqueue` never awaits. A slow or failing sink only grows the queue; the
//! workers retry a bounded number of times and then drop with a log line.
//!
//! ### Result Codes
//!
//! Every journaled request carries a `result-code`: `000` success, `001`
//! handler-reported failure, `002` unknown command, `003` handler fault.

pub mod commands;
pub mod config;
pub mod connection;
pub mod journal;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::{CommandRegistry, Handler, HandlerError, Reply, RequestFilter};
pub use config::ServerConfig;
pub use connection::{ConnectionStats, ConnectionTracker, Dispatcher};
pub use journal::{PersistenceSink, TransactionQueue};
pub use protocol::{Frame, FrameParser, ParseError, Request, Value};
pub use server::{Server, ServerError};
pub use storage::{Session, SharedStore};

/// The default port Switchboard listens on
pub const DEFAULT_PORT: u16 = 7800;

/// The default host Switchboard binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of Switchboard
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
