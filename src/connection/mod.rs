//! Connection Module
//!
//! This module owns everything between an accepted socket and a handler call.
//! Each client connection is handled by its own async task with its own
//! session; the only state shared between tasks is the registry, the store,
//! the journal queue and the statistics.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept() + ConnectionTracker::register
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Read bytes  │───>│ Decode frame│───>│ Dispatcher  │     │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘     │
//! │                                               │ enqueue     │
//! │                                               ▼             │
//! │                                      ┌─────────────┐        │
//! │                                      │ Send reply  │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `dispatcher`: Registry lookup, panic isolation, outcome stamping, journal hand-off
//! - `handler`: The per-connection read/decode/dispatch/write loop
//! - `tracker`: Live connection ids and external close

pub mod dispatcher;
pub mod handler;
pub mod tracker;

// Re-export commonly used types
pub use dispatcher::{Dispatched, Dispatcher};
pub use handler::{ConnectionError, ConnectionHandler, ConnectionStats, StatsSnapshot};
pub use tracker::{ConnectionGuard, ConnectionInfo, ConnectionTracker};
