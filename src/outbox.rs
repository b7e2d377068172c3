//! Outbox abstractions and backend drivers.
//!
//! This module implements the *outbox pattern*: an [`Envelope`] is recorded
//! inside the same transaction that mutates application state, then moved
//! into the live queue later by a forwarder. The outbox is responsible for
//! **durability and ordering**; the atomic hand-over into the queue is the
//! bridge on the queue side
//! ([`TransferOutgoing`](crate::queue::TransferOutgoing)).
//!
//! ## Responsibilities
//!
//! - Persist outgoing messages atomically with application state
//! - Stream outgoing messages for forwarding
//! - Report the outstanding count for administrative monitoring
//!
//! ## Components
//!
//! - [`Outbox`]: high-level façade over an outbox backend
//! - [`StoreOutgoing`]: trait for recording messages in a caller transaction
//! - [`StreamOutgoing`]: trait for streaming outgoing messages
//! - [`CountOutgoing`]: trait for the outstanding counter
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::Envelope;

/// Error returned by outbox operations.
///
/// Wraps the failure kind and captures a tracing span backtrace for
/// improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Outbox error taxonomy.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// An outgoing row with this id is already recorded.
    DuplicateKey,
    /// The outgoing row is absent; the message was already forwarded.
    NotFound,
    /// Any other backend failure.
    Backend(tower::BoxError),
}

impl OutboxError {
    /// Create a duplicate-key outbox error.
    pub fn duplicate_key() -> Self {
        Self::with_kind(OutboxErrorKind::DuplicateKey)
    }

    /// Create a row-absent outbox error.
    pub fn not_found() -> Self {
        Self::with_kind(OutboxErrorKind::NotFound)
    }

    /// Create a backend-related outbox error.
    pub fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::with_kind(OutboxErrorKind::Backend(err))
    }

    fn with_kind(kind: OutboxErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The kind of failure.
    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }

    /// Whether the insert was rejected on an already-present id.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.kind, OutboxErrorKind::DuplicateKey)
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::DuplicateKey => writeln!(f, "Outgoing message already recorded"),
            OutboxErrorKind::NotFound => writeln!(f, "Outgoing message not found"),
            OutboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::DuplicateKey | OutboxErrorKind::NotFound => None,
            OutboxErrorKind::Backend(err) => Some(err.as_ref()),
        }
    }
}

/// High-level façade over an outbox backend.
///
/// `Outbox` provides a stable, ergonomic API for recording outgoing
/// messages while delegating persistence and streaming behavior to the
/// underlying backend.
#[derive(Clone)]
pub struct Outbox<D>(D);

impl<D> Outbox<D>
where
    D: Clone,
{
    /// Create a new outbox backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }
}

impl<D> Outbox<D> {
    /// Record envelopes as outgoing within the caller's transaction.
    ///
    /// The messages are **not** enqueued yet; they become durable together
    /// with the business state the transaction mutates and are moved into
    /// the queue later by a forwarder.
    #[instrument(skip_all)]
    pub async fn store_outgoing(
        &self,
        envelopes: impl IntoIterator<Item = Envelope>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<(), OutboxError>
    where
        D: StoreOutgoing + Sync,
    {
        let envelopes: Vec<Envelope> = envelopes.into_iter().collect();
        self.0.store_outgoing(envelopes, tx).await
    }

    /// Number of outgoing messages not yet moved into a queue.
    ///
    /// After a successful move this count and the queue's ready count change
    /// together; there is no observable state where the message counts in
    /// both places or in neither.
    pub async fn outstanding_count(&self) -> Result<u64, OutboxError>
    where
        D: CountOutgoing + Sync,
    {
        self.0.outstanding_count().await
    }

    /// Stream outgoing envelopes until cancellation.
    pub async fn messages(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope, OutboxError>>, OutboxError>
    where
        D: StreamOutgoing + Sync,
    {
        self.0.messages(cancel).await
    }
}

/// Trait for recording outgoing messages.
///
/// Implementations must insert within the transaction handed in by the
/// caller so the messages commit or roll back together with the business
/// state.
#[async_trait::async_trait]
pub trait StoreOutgoing {
    /// Transaction type used for atomic insertion.
    type Transaction<'a>;

    /// Record a batch of envelopes as outgoing.
    async fn store_outgoing(
        &self,
        envelopes: Vec<Envelope>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), OutboxError>;
}

/// Trait for the administrative outstanding counter.
#[async_trait::async_trait]
pub trait CountOutgoing {
    /// Number of outgoing messages awaiting forwarding.
    async fn outstanding_count(&self) -> Result<u64, OutboxError>;
}

/// Trait for streaming outgoing messages.
///
/// The returned stream should:
/// - Yield messages in recording order
/// - Respect cancellation via the provided [`CancellationToken`]
#[async_trait::async_trait]
pub trait StreamOutgoing {
    /// Stream outgoing messages until exhaustion or cancellation.
    async fn messages(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope, OutboxError>>, OutboxError>;
}
