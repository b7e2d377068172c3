//! Queue abstractions and backend drivers.
//!
//! This module implements a durable message queue over a relational store:
//! messages are persisted ready or scheduled, scheduled messages are
//! promoted once due, and expired messages are reaped. Every time
//! comparison resolves through the store's own clock so that skewed process
//! clocks cannot disagree about what is due.
//!
//! ## Responsibilities
//!
//! - Persist messages exactly once, ready or scheduled
//! - Promote scheduled messages once their time has come
//! - Reap messages whose delivery deadline has passed
//! - Move messages out of the outbox atomically
//!
//! ## Components
//!
//! - [`Queue`]: high-level façade over a queue backend
//! - [`SystemClock`]: store-time authority
//! - [`InsertMessages`], [`InspectMessages`]: row operations
//! - [`PromoteMessages`], [`ExpireMessages`]: set-based state transitions
//! - [`TransferOutgoing`]: the atomic outbox → queue bridge
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;
pub mod maintenance;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::envelope::{Envelope, MessageState};

/// Error returned by queue operations.
///
/// Carries the failure kind callers branch on plus a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct QueueError {
    context: SpanTrace,
    kind: QueueErrorKind,
}

/// Queue error taxonomy.
#[derive(Debug)]
pub enum QueueErrorKind {
    /// Insert of an already-present message id. Safe to treat as a no-op
    /// when retrying a send.
    DuplicateKey,
    /// Source row absent in a move or delete-by-id operation; the message
    /// was already processed.
    NotFound,
    /// Connectivity, timeout, or deadlock-victim failure. Safe to retry
    /// with backoff; the queue never retries internally.
    Transient(tower::BoxError),
    /// Missing schema or table. Fatal, not worth retrying.
    Configuration(tower::BoxError),
    /// Any other backend failure.
    Backend(tower::BoxError),
}

impl QueueError {
    /// Create a duplicate-key error.
    pub fn duplicate_key() -> Self {
        Self::with_kind(QueueErrorKind::DuplicateKey)
    }

    /// Create a source-row-absent error.
    pub fn not_found() -> Self {
        Self::with_kind(QueueErrorKind::NotFound)
    }

    /// Create a retryable store error.
    pub fn transient(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::with_kind(QueueErrorKind::Transient(err))
    }

    /// Create a missing-schema error.
    pub fn configuration(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::with_kind(QueueErrorKind::Configuration(err))
    }

    /// Create a backend-related error.
    pub fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::with_kind(QueueErrorKind::Backend(err))
    }

    fn with_kind(kind: QueueErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The kind of failure.
    pub fn kind(&self) -> &QueueErrorKind {
        &self.kind
    }

    /// Whether the insert was rejected on an already-present id.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.kind, QueueErrorKind::DuplicateKey)
    }

    /// Whether the source row was already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, QueueErrorKind::NotFound)
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            QueueErrorKind::DuplicateKey => writeln!(f, "Message id already present"),
            QueueErrorKind::NotFound => writeln!(f, "Message not found"),
            QueueErrorKind::Transient(err) => writeln!(f, "Transient store error: {err}"),
            QueueErrorKind::Configuration(err) => writeln!(f, "Store configuration error: {err}"),
            QueueErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            QueueErrorKind::DuplicateKey | QueueErrorKind::NotFound => None,
            QueueErrorKind::Transient(err)
            | QueueErrorKind::Configuration(err)
            | QueueErrorKind::Backend(err) => Some(err.as_ref()),
        }
    }
}

/// Store-time authority.
///
/// Multiple producer and consumer processes may carry skewed local clocks;
/// every scheduling and expiration decision resolves through this trait so
/// they all agree on one authority.
#[async_trait::async_trait]
pub trait SystemClock {
    /// Current timestamp as reported by the store itself.
    async fn system_time(&self) -> Result<DateTime<Utc>, QueueError>;
}

/// Trait for inserting messages into the queue.
#[async_trait::async_trait]
pub trait InsertMessages {
    /// Insert one message in the given state.
    ///
    /// Fails with [`QueueErrorKind::DuplicateKey`] and no side effects when
    /// the id is already present.
    async fn insert_message(
        &self,
        envelope: &Envelope,
        state: MessageState,
    ) -> Result<(), QueueError>;
}

/// Read-only row accessors.
///
/// Counts are snapshots at the store's isolation level; they hold no
/// long-lived locks.
#[async_trait::async_trait]
pub trait InspectMessages {
    /// Number of ready messages in the queue.
    async fn ready_count(&self) -> Result<u64, QueueError>;

    /// Number of scheduled messages in the queue.
    async fn scheduled_count(&self) -> Result<u64, QueueError>;

    /// A batch of ready messages, oldest first.
    async fn select_ready(&self, limit: u32) -> Result<Vec<Envelope>, QueueError>;
}

/// Set-based promotion of due scheduled messages.
#[async_trait::async_trait]
pub trait PromoteMessages {
    /// Flip every scheduled message with `scheduled_time <= now` to ready.
    ///
    /// Must be a single atomic statement: a concurrent reader never observes
    /// a message absent from both the scheduled and the ready counts.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;
}

/// Set-based reaping of expired messages.
#[async_trait::async_trait]
pub trait ExpireMessages {
    /// Delete every message with a non-null `deliver_by <= now`, across
    /// states. Messages without a deadline are never touched.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;
}

/// Atomic transfer of a message out of the outbox into the queue.
#[async_trait::async_trait]
pub trait TransferOutgoing {
    /// Delete the outbox row and insert the queue row as one unit of work.
    ///
    /// Fails with [`QueueErrorKind::NotFound`] when the outbox row is
    /// already gone and with [`QueueErrorKind::DuplicateKey`] when the queue
    /// already holds the id; either way the store is left untouched.
    async fn move_from_outgoing(
        &self,
        envelope: &Envelope,
        state: MessageState,
    ) -> Result<(), QueueError>;
}

/// High-level façade over a queue backend.
///
/// `Queue` composes the store clock, scheduling classification, and row
/// operations into the public sending and maintenance surface. It holds no
/// state of its own; all mutual exclusion is delegated to the store's
/// transaction and row-locking semantics.
#[derive(Clone)]
pub struct Queue<D>(D);

impl<D> Queue<D>
where
    D: Clone,
{
    /// Create a new queue backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }
}

impl<D> Queue<D> {
    /// Enqueue a message.
    ///
    /// The schedule is resolved against the store clock: a message whose
    /// scheduled moment lies in the future is persisted as scheduled,
    /// anything else as ready. Sending the same envelope id twice is a
    /// no-op, which makes retries after an ambiguous failure safe.
    #[instrument(skip(self, envelope), fields(id = %envelope.id, queue = %envelope.destination))]
    pub async fn send(&self, envelope: Envelope) -> Result<(), QueueError>
    where
        D: SystemClock + InsertMessages + Sync,
    {
        let now = self.0.system_time().await?;
        let mut envelope = envelope;
        envelope.resolve_schedule(now);
        let state = envelope.state_at(now);

        match self.0.insert_message(&envelope, state).await {
            Err(err) if err.is_duplicate_key() => {
                tracing::debug!("message already enqueued, skipping");
                Ok(())
            }
            outcome => outcome,
        }
    }

    /// Number of ready messages.
    pub async fn ready_count(&self) -> Result<u64, QueueError>
    where
        D: InspectMessages + Sync,
    {
        self.0.ready_count().await
    }

    /// Number of scheduled messages.
    pub async fn scheduled_count(&self) -> Result<u64, QueueError>
    where
        D: InspectMessages + Sync,
    {
        self.0.scheduled_count().await
    }

    /// Fetch a batch of ready messages, oldest first.
    pub async fn select_ready(&self, limit: u32) -> Result<Vec<Envelope>, QueueError>
    where
        D: InspectMessages + Sync,
    {
        self.0.select_ready(limit).await
    }

    /// Promote every scheduled message that is due by the store clock.
    ///
    /// Returns the number of messages promoted.
    #[instrument(skip(self))]
    pub async fn promote_due(&self) -> Result<u64, QueueError>
    where
        D: SystemClock + PromoteMessages + Sync,
    {
        let now = self.0.system_time().await?;
        self.0.promote_due(now).await
    }

    /// Delete every message whose delivery deadline has passed by the store
    /// clock.
    ///
    /// Returns the number of rows removed.
    #[instrument(skip(self))]
    pub async fn delete_expired(&self) -> Result<u64, QueueError>
    where
        D: SystemClock + ExpireMessages + Sync,
    {
        let now = self.0.system_time().await?;
        self.0.delete_expired(now).await
    }

    /// Move a message from the outbox into the queue as one unit of work.
    ///
    /// The state it lands in is resolved against the store clock, the same
    /// classification [`send`](Queue::send) applies. An absent outbox row
    /// surfaces as [`QueueErrorKind::NotFound`]; callers treat it as
    /// already-completed.
    #[instrument(skip(self, envelope), fields(id = %envelope.id, queue = %envelope.destination))]
    pub async fn move_from_outgoing(&self, envelope: &Envelope) -> Result<(), QueueError>
    where
        D: SystemClock + TransferOutgoing + Sync,
    {
        let now = self.0.system_time().await?;
        let mut envelope = envelope.clone();
        envelope.resolve_schedule(now);
        let state = envelope.state_at(now);

        self.0.move_from_outgoing(&envelope, state).await
    }

    /// Current store time.
    pub async fn system_time(&self) -> Result<DateTime<Utc>, QueueError>
    where
        D: SystemClock + Sync,
    {
        self.0.system_time().await
    }
}
