//! Forwarding loop moving outbox messages into the live queue.
//!
//! This module implements a generic *outbox forwarder* that:
//!
//! - Streams outgoing envelopes from an outbox
//! - Transfers each into the queue through the atomic bridge
//! - Treats messages moved by a concurrent actor as already completed
//! - Exposes lifecycle hooks for observability and customization
//!
//! The forwarder runs until:
//! - The outbox stream ends
//! - A fatal error occurs
//! - A [`CancellationToken`] is triggered

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::outbox::{OutboxError, StreamOutgoing};
use crate::queue::{Queue, QueueError, SystemClock, TransferOutgoing};

/// Outbox forwarder.
///
/// The `Forwarder` continuously pulls outgoing envelopes and moves them into
/// the queue. The move is atomic on the store side, so a crash mid-run never
/// leaves a message in both places or in neither; a transfer that comes back
/// `NotFound` was completed by a concurrent forwarder and is skipped.
///
/// Generic parameters:
/// - `D`: Outbox backend implementation
/// - `T`: Queue backend implementation
/// - `HK`: Hook implementation for lifecycle events
pub struct Forwarder<D, T, HK = DefaultForwarderHook> {
    outbox: D,
    queue: Queue<T>,
    hook: HK,
}

impl<D, T> Forwarder<D, T, DefaultForwarderHook>
where
    D: StreamOutgoing + Send,
{
    /// Create a new forwarder with the default hook implementation.
    pub fn new(outbox: D, queue: Queue<T>) -> Self {
        Self {
            outbox,
            queue,
            hook: DefaultForwarderHook,
        }
    }
}

impl<D, T, HK> Forwarder<D, T, HK>
where
    D: StreamOutgoing + Send + Sync,
    T: SystemClock + TransferOutgoing + Sync,
    HK: ForwarderHook,
{
    /// Replace the forwarder hook while keeping all other generics
    /// unchanged.
    ///
    /// This allows customizing behavior (logging, metrics, etc.) without
    /// rebuilding the forwarder.
    pub fn with_hook<HK2: ForwarderHook>(self, hook: HK2) -> Forwarder<D, T, HK2> {
        Forwarder {
            outbox: self.outbox,
            queue: self.queue,
            hook,
        }
    }

    /// Run the forwarding loop.
    ///
    /// The forwarder:
    /// - Subscribes to the outgoing message stream
    /// - Moves each message into the queue
    /// - Skips messages already moved by a concurrent actor
    /// - Stops on cancellation, stream end, or fatal error
    ///
    /// A fatal error aborts the run; the caller retries with backoff, which
    /// is safe because the bridge is idempotent.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ForwarderRunError> {
        self.hook.on_startup();

        let mut messages = self
            .outbox
            .messages(cancel.clone())
            .await
            .map_err(ForwarderRunError::outbox)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    break;
                }
                message = messages.next() => {
                    match message {
                        Some(Ok(envelope)) => {
                            self.hook.on_next_message(&envelope);

                            match self.queue.move_from_outgoing(&envelope).await {
                                Ok(()) => self.hook.on_message_moved(&envelope),
                                Err(err) if err.is_not_found() => {
                                    self.hook.on_already_moved(&envelope);
                                }
                                Err(err) => {
                                    self.hook.on_move_error(&err);
                                    return Err(ForwarderRunError::queue(err));
                                }
                            }
                        }
                        Some(Err(err)) => {
                            self.hook.on_message_receive_error(&err);
                            return Err(ForwarderRunError::outbox(err));
                        }
                        None => {
                            self.hook.on_outbox_stream_end();
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Error returned when the forwarder loop fails.
#[derive(Debug)]
pub struct ForwarderRunError {
    context: tracing_error::SpanTrace,
    kind: ForwarderRunErrorKind,
}

impl ForwarderRunError {
    fn outbox(error: OutboxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ForwarderRunErrorKind::Outbox(error),
        }
    }

    fn queue(error: QueueError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ForwarderRunErrorKind::Queue(error),
        }
    }

    /// The kind of failure.
    pub fn kind(&self) -> &ForwarderRunErrorKind {
        &self.kind
    }
}

/// Classification of forwarder runtime errors.
#[derive(Debug)]
pub enum ForwarderRunErrorKind {
    /// Errors originating from the outbox.
    Outbox(OutboxError),
    /// Errors originating from the queue bridge.
    Queue(QueueError),
}

impl std::fmt::Display for ForwarderRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ForwarderRunErrorKind::Outbox(err) => writeln!(f, "Outbox error: {err}"),
            ForwarderRunErrorKind::Queue(err) => writeln!(f, "Queue error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ForwarderRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ForwarderRunErrorKind::Outbox(err) => Some(err),
            ForwarderRunErrorKind::Queue(err) => Some(err),
        }
    }
}

/// Hook trait for observing forwarder lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait ForwarderHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_next_message(&self, envelope: &Envelope);
    fn on_message_moved(&self, envelope: &Envelope);
    fn on_already_moved(&self, envelope: &Envelope);
    fn on_message_receive_error(&self, error: &dyn std::error::Error);
    fn on_move_error(&self, error: &dyn std::error::Error);
    fn on_outbox_stream_end(&self);
}

/// Default forwarder hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultForwarderHook;

impl ForwarderHook for DefaultForwarderHook {
    fn on_startup(&self) {
        tracing::info!("Forwarder is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Forwarder is shutting down");
    }

    fn on_next_message(&self, envelope: &Envelope) {
        tracing::debug!(id = %envelope.id, "Outgoing message received");
    }

    fn on_message_moved(&self, envelope: &Envelope) {
        tracing::info!(id = %envelope.id, queue = %envelope.destination, "Message moved into queue");
    }

    fn on_already_moved(&self, envelope: &Envelope) {
        tracing::debug!(id = %envelope.id, "Message already moved, skipping");
    }

    fn on_message_receive_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error receiving outgoing message");
    }

    fn on_move_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error moving message into queue");
    }

    fn on_outbox_stream_end(&self) {
        tracing::info!("Outbox stream ended");
    }
}
