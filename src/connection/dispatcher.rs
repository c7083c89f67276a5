//! Request Dispatcher
//!
//! Turns one decoded [`Request`] into a [`Reply`]:
//!
//! 1. Run the direction's [`RequestFilter`], if one is installed. A refusal
//!    skips the handler and is answered like a handler error.
//! 2. Resolve the handler for the command in this dispatcher's [`Direction`].
//! 3. Unknown command: empty reply, outcome `002`.
//! 4. Otherwise run the handler behind a fault boundary. A returned error or
//!    a panic becomes a failure outcome plus an error map reply.
//! 5. Stamp the final outcome onto the request and enqueue it on the
//!    [`TransactionQueue`]. Enqueue never waits.
//!
//! Nothing that happens inside a handler can end the connection.

use crate::commands::{
    CommandRegistry, ConnectionContext, Direction, FilterRef, HandlerError, Reply,
};
use crate::connection::ConnectionStats;
use crate::journal::{EnqueueStatus, Transaction, TransactionQueue};
use crate::protocol::{Outcome, Request, ResultCode};
use crate::storage::Session;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Detail recorded for a request whose connection closed mid-processing.
pub const ABANDONED_DETAIL: &str = "connection closed during processing";

/// Result of dispatching one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub reply: Reply,
    pub outcome: Outcome,
    pub journal: EnqueueStatus,
}

/// Routes requests to handlers. Cheap to clone; one per connection.
#[derive(Clone)]
pub struct Dispatcher {
    direction: Direction,
    registry: Arc<CommandRegistry>,
    filter: Option<FilterRef>,
    queue: TransactionQueue,
    stats: Arc<ConnectionStats>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("direction", &self.direction)
            .field("registry", &self.registry)
            .field("filter", &self.filter.as_ref().map(|filter| filter.name()))
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        direction: Direction,
        registry: Arc<CommandRegistry>,
        queue: TransactionQueue,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            direction,
            registry,
            filter: None,
            queue,
            stats,
        }
    }

    /// Installs the filter every request passes before its handler.
    pub fn with_filter(mut self, filter: FilterRef) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Processes one request and records it in the journal.
    pub async fn dispatch(
        &self,
        mut request: Request,
        session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Dispatched {
        self.stats.request_processed();
        let reply = self.process(&mut request, session, ctx).await;
        self.record(reply, request, session, ctx)
    }

    /// Like [`dispatch`](Self::dispatch), but abandons the filter or handler
    /// as soon as `cancel` completes and returns `None`.
    ///
    /// An abandoned request is still journaled, with a fault outcome.
    pub async fn dispatch_until(
        &self,
        mut request: Request,
        session: &mut Session,
        ctx: &ConnectionContext,
        cancel: impl Future<Output = ()>,
    ) -> Option<Dispatched> {
        self.stats.request_processed();

        let reply = tokio::select! {
            biased;
            reply = self.process(&mut request, session, ctx) => Some(reply),
            _ = cancel => None,
        };

        match reply {
            Some(reply) => Some(self.record(reply, request, session, ctx)),
            None => {
                self.stats.handler_fault();
                warn!(
                    client = %ctx.peer,
                    command = %request.command(),
                    "Connection closed during processing, request abandoned"
                );
                request.set_outcome(Outcome::fault(ABANDONED_DETAIL));
                self.record(Reply::empty(), request, session, ctx);
                None
            }
        }
    }

    /// Runs the filter and the handler, leaving the outcome on `request`.
    async fn process(
        &self,
        request: &mut Request,
        session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Reply {
        if let Some(filter) = &self.filter {
            let refused = guarded(filter.filter(request, session, ctx), filter.name(), ctx)
                .await
                .err();
            if let Some(e) = refused {
                return self.on_error(request, ctx, e);
            }
        }

        match self.registry.resolve(self.direction, request.command()) {
            None => {
                self.stats.unknown_command();
                debug!(
                    client = %ctx.peer,
                    command = %request.command(),
                    direction = %self.direction,
                    "Unknown command"
                );
                request.set_outcome(Outcome::unknown_command(request.command()));
                Reply::empty()
            }
            Some(handler) => {
                let handler = Arc::clone(handler);
                trace!(
                    client = %ctx.peer,
                    command = %request.command(),
                    handler = handler.name(),
                    "Dispatching"
                );

                match guarded(handler.process(request, session, ctx), handler.name(), ctx).await {
                    Ok(reply) => reply,
                    Err(e) => self.on_error(request, ctx, e),
                }
            }
        }
    }

    /// Journals the finished request.
    fn record(
        &self,
        reply: Reply,
        request: Request,
        session: &Session,
        ctx: &ConnectionContext,
    ) -> Dispatched {
        let transaction = Transaction::new(session.id(), session.peer(), request);
        let outcome = transaction.outcome.clone();
        let journal = self.queue.enqueue(transaction);
        if journal == EnqueueStatus::Closed {
            debug!(client = %ctx.peer, "Journal closed, transaction not recorded");
        }

        Dispatched {
            reply,
            outcome,
            journal,
        }
    }

    fn on_error(&self, request: &mut Request, ctx: &ConnectionContext, err: HandlerError) -> Reply {
        let outcome = err.outcome();
        if outcome.code == ResultCode::HandlerFault {
            self.stats.handler_fault();
            warn!(client = %ctx.peer, command = %request.command(), error = %err, "Handler fault");
        } else {
            debug!(client = %ctx.peer, command = %request.command(), error = %err, "Request rejected");
        }
        request.set_outcome(outcome);
        Reply::Data(err.to_payload())
    }
}

/// Fault boundary: a panic inside `work` becomes [`HandlerError::Fault`].
async fn guarded<T>(
    work: impl Future<Output = Result<T, HandlerError>>,
    name: &'static str,
    ctx: &ConnectionContext,
) -> Result<T, HandlerError> {
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(client = %ctx.peer, handler = name, panic = %message, "Handler panicked");
            Err(HandlerError::Fault(format!("panic: {}", message)))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
