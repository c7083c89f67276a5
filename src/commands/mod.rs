//! Command Dispatch Module
//!
//! This module defines how a command code turns into work:
//!
//! ```text
//!   configuration                 bootstrap                    dispatch
//! ┌────────────────┐      ┌───────────────────┐       ┌────────────────────┐
//! │ [[inbound]]    │      │  HandlerCatalog   │       │  CommandRegistry   │
//! │ ADD_USER,      │─────>│  "user.create" ──>│──────>│  ADD_USER → Arc<H> │
//! │   user.create  │      │   constructor     │       │  (immutable)       │
//! └────────────────┘      └───────────────────┘       └─────────┬──────────┘
//!                                                               │ resolve()
//!                                                               ▼
//!                                                     ┌────────────────────┐
//!                                                     │  Handler::process  │
//!                                                     │  (request, session,│
//!                                                     │   context)         │
//!                                                     └────────────────────┘
//! ```
//!
//! - `handler`: the [`Handler`] and [`RequestFilter`] traits, [`Reply`] and
//!   [`HandlerError`]
//! - `registry`: [`CommandRegistry`], [`HandlerCatalog`] and bootstrap
//! - `builtin`: the handlers that ship with the server

pub mod builtin;
pub mod handler;
pub mod registry;

pub use handler::{
    error_payload, ConnectionContext, FilterRef, Handler, HandlerError, Reply, RequestFilter,
    ERROR_CODE_KEY, ERROR_MESSAGE_KEY, INTERNAL_ERROR_CODE,
};
pub use registry::{
    CommandBinding, CommandRegistry, Direction, HandlerCatalog, HandlerConstructor, HandlerRef,
    RegistryBuilder, RegistryError,
};
