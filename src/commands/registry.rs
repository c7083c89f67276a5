//! Command Registry
//!
//! Maps command codes to handler instances, separately for the inbound
//! (server-side) and outbound (client-side) directions.
//!
//! The registry is built once at bootstrap through a [`RegistryBuilder`] and
//! is immutable afterwards. Lookups are plain `HashMap` reads on a value
//! shared through `Arc`, so the dispatch path takes no lock.
//!
//! Handler identifiers in the configuration (`user.create`, `file.view`, ...)
//! are turned into instances by a [`HandlerCatalog`].

use crate::commands::Handler;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Shared handle to a handler instance.
pub type HandlerRef = Arc<dyn Handler>;

/// Builds a handler instance for one registration.
pub type HandlerConstructor = Box<dyn Fn() -> HandlerRef + Send + Sync>;

/// Which side of the connection a command table serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Requests arriving at this server.
    Inbound,
    /// Messages arriving on connections this process opened.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Errors raised while building the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("command '{command}' is already registered ({direction})")]
    DuplicateCommand { direction: Direction, command: String },

    #[error("unknown handler '{handler}' for command '{command}'")]
    UnknownHandler { command: String, handler: String },

    #[error("command code must not be empty")]
    EmptyCommand,
}

/// One `(command code, handler identifier)` pair from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandBinding {
    pub command: String,
    pub handler: String,
}

impl CommandBinding {
    pub fn new(command: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            handler: handler.into(),
        }
    }
}

/// Named handler constructors, resolved at bootstrap.
#[derive(Default)]
pub struct HandlerCatalog {
    constructors: HashMap<String, HandlerConstructor>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constructor under `id`, replacing any previous one.
    pub fn insert<F>(&mut self, id: impl Into<String>, constructor: F)
    where
        F: Fn() -> HandlerRef + Send + Sync + 'static,
    {
        self.constructors.insert(id.into(), Box::new(constructor));
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with<F>(mut self, id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> HandlerRef + Send + Sync + 'static,
    {
        self.insert(id, constructor);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    /// Creates a new instance of the handler registered as `id`.
    pub fn instantiate(&self, id: &str) -> Option<HandlerRef> {
        self.constructors.get(id).map(|constructor| constructor())
    }

    /// Sorted handler identifiers.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.constructors.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("handlers", &self.identifiers())
            .finish()
    }
}

type CommandTable = HashMap<String, HandlerRef>;

/// Mutable registry under construction.
#[derive(Default)]
pub struct RegistryBuilder {
    inbound: CommandTable,
    outbound: CommandTable,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `command` to `handler` in `direction`.
    ///
    /// Fails if the code is already bound in that direction. The same code
    /// may be bound once per direction.
    pub fn register(
        &mut self,
        direction: Direction,
        command: &str,
        handler: HandlerRef,
    ) -> Result<(), RegistryError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(RegistryError::EmptyCommand);
        }

        let table = match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        };
        if table.contains_key(command) {
            return Err(RegistryError::DuplicateCommand {
                direction,
                command: command.to_string(),
            });
        }

        debug!(%direction, command, handler = handler.name(), "Registered command");
        table.insert(command.to_string(), handler);
        Ok(())
    }

    pub fn build(self) -> CommandRegistry {
        CommandRegistry {
            inbound: self.inbound,
            outbound: self.outbound,
        }
    }
}

/// The immutable command table.
///
/// # Example
///
/// ```
/// use switchboard::commands::{builtin, CommandBinding, CommandRegistry, Direction};
///
/// let registry = CommandRegistry::bootstrap(
///     &builtin::catalog(),
///     &[CommandBinding::new("PING", "system.ping")],
///     &[],
/// )
/// .unwrap();
///
/// assert!(registry.resolve(Direction::Inbound, "PING").is_some());
/// assert!(registry.resolve(Direction::Outbound, "PING").is_none());
/// ```
#[derive(Default)]
pub struct CommandRegistry {
    inbound: CommandTable,
    outbound: CommandTable,
}

impl CommandRegistry {
    /// Builds the registry from ordered inbound and outbound binding lists.
    ///
    /// Each binding gets its own handler instance from `catalog`.
    pub fn bootstrap(
        catalog: &HandlerCatalog,
        inbound: &[CommandBinding],
        outbound: &[CommandBinding],
    ) -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::new();

        for (direction, bindings) in [(Direction::Inbound, inbound), (Direction::Outbound, outbound)] {
            for binding in bindings {
                let handler = catalog.instantiate(binding.handler.trim()).ok_or_else(|| {
                    RegistryError::UnknownHandler {
                        command: binding.command.clone(),
                        handler: binding.handler.clone(),
                    }
                })?;
                builder.register(direction, &binding.command, handler)?;
            }
        }

        let registry = builder.build();
        info!(
            inbound = registry.len(Direction::Inbound),
            outbound = registry.len(Direction::Outbound),
            "Command registry bootstrapped"
        );
        Ok(registry)
    }

    fn table(&self, direction: Direction) -> &CommandTable {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Looks up the handler bound to `command`.
    pub fn resolve(&self, direction: Direction, command: &str) -> Option<&HandlerRef> {
        self.table(direction).get(command)
    }

    pub fn len(&self, direction: Direction) -> usize {
        self.table(direction).len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty() && self.outbound.is_empty()
    }

    /// Sorted command codes for one direction.
    pub fn commands(&self, direction: Direction) -> Vec<&str> {
        let mut codes: Vec<_> = self.table(direction).keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("inbound", &self.commands(Direction::Inbound))
            .field("outbound", &self.commands(Direction::Outbound))
            .finish()
    }
}
