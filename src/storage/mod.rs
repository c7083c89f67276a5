//! Session Store Module
//!
//! This module holds the two kinds of state handlers may read and write:
//!
//! - [`Session`]: a per-connection attribute bag, owned by the connection
//!   task and never visible to other connections.
//! - [`SharedStore`]: a process-wide, namespaced store (credential cache and
//!   similar cross-request state) with optional TTL.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Connection A │   │ Connection B │   │ Connection C │
//! │   Session    │   │   Session    │   │   Session    │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │                  │                  │
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!        ┌─────────────────────────────────────┐
//!        │            SharedStore              │
//!        │   (64 shards, namespaced keys)      │
//!        └─────────────────────────────────────┘
//!                           ▲
//!              ┌────────────┴────────────┐
//!              │      ExpirySweeper      │
//!              │  (Background Tokio Task)│
//!              └─────────────────────────┘
//! ```

pub mod expiry;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use session::{Session, SessionId, CAPTCHA_ATTRIBUTE};
pub use store::{
    SharedStore, StoreEntry, StoreError, StoreStats, CREDENTIALS_ID_NAMESPACE,
    CREDENTIALS_NAMESPACE,
};
