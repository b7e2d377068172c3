use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::outbox::{CountOutgoing, OutboxError, StoreOutgoing, StreamOutgoing};
use crate::queue::sqlx::decode_envelope;

pub(crate) const OUTGOING_TABLE: &str = "outgoing_messages";

/// Postgres outbox backend.
///
/// Outgoing rows are recorded inside the caller's transaction and carry a
/// serial `position`, so forwarding preserves recording order. Rows remain
/// in the table until the bridge moves them into the queue.
#[derive(Clone)]
pub struct SqlxOutbox {
    pool: PgPool,
    schema: Option<String>,
    poll_interval: Duration,
    fetch_size: usize,
}

impl SqlxOutbox {
    /// Create an outbox handle assuming an already-provisioned schema.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self {
            pool,
            schema: None,
            poll_interval: Duration::from_secs(1),
            fetch_size: 100, // default batch per poll
        }
    }

    /// Qualify the outgoing table with an explicit schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the interval between polls of the outgoing table.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum number of rows fetched per poll.
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = size;
        self
    }

    /// Create an outbox handle and ensure the outgoing table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, OutboxError> {
        let outbox = Self::new_uninitialized(pool);
        outbox.provision().await?;
        Ok(outbox)
    }

    /// Create the schema and outgoing table if they do not exist.
    pub async fn provision(&self) -> Result<(), OutboxError> {
        if let Some(schema) = &self.schema {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .execute(&self.pool)
                .await?;
        }
        create_outgoing_table(&self.pool, &self.outgoing_table()).await?;
        Ok(())
    }

    fn outgoing_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{OUTGOING_TABLE}"),
            None => OUTGOING_TABLE.to_string(),
        }
    }

    async fn fetch_batch(&self) -> Result<Vec<Envelope>, OutboxError> {
        let sql = format!(
            "SELECT id, destination, payload, deliver_by, scheduled_time FROM {}
             ORDER BY position LIMIT $1",
            self.outgoing_table()
        );
        let rows = sqlx::query(&sql)
            .bind(self.fetch_size as i64)
            .fetch_all(&self.pool)
            .await?;
        let envelopes = rows
            .iter()
            .map(decode_envelope)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(envelopes)
    }
}

/// Ensures the outgoing table exists.
pub(crate) async fn create_outgoing_table(pool: &PgPool, table: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id UUID PRIMARY KEY,
            destination TEXT NOT NULL,
            payload BYTEA NOT NULL,
            deliver_by TIMESTAMPTZ,
            scheduled_time TIMESTAMPTZ,
            position BIGSERIAL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    ))
    .execute(pool)
    .await?;
    Ok(())
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return OutboxError::duplicate_key();
            }
        }
        match err {
            sqlx::Error::RowNotFound => OutboxError::not_found(),
            err => OutboxError::backend(err.into()),
        }
    }
}

#[async_trait]
impl StoreOutgoing for SqlxOutbox {
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    async fn store_outgoing(
        &self,
        envelopes: Vec<Envelope>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), OutboxError> {
        let sql = format!(
            "INSERT INTO {} (id, destination, payload, deliver_by, scheduled_time)
             VALUES ($1, $2, $3, $4, $5)",
            self.outgoing_table()
        );
        for envelope in &envelopes {
            sqlx::query(&sql)
                .bind(envelope.id)
                .bind(&envelope.destination)
                .bind(envelope.payload.as_slice())
                .bind(envelope.deliver_by)
                .bind(envelope.scheduled_time)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CountOutgoing for SqlxOutbox {
    async fn outstanding_count(&self) -> Result<u64, OutboxError> {
        let sql = format!("SELECT count(*) FROM {}", self.outgoing_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl StreamOutgoing for SqlxOutbox {
    /// Poll the outgoing table on an interval, yielding rows oldest first.
    ///
    /// A row stays in the table until the bridge moves it, so it may be
    /// yielded again on a later poll; the forwarder's `NotFound` handling
    /// makes the repeat harmless.
    async fn messages(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope, OutboxError>>, OutboxError> {
        let this = self.clone();
        let stream = stream! {
            let mut ticker = tokio::time::interval(this.poll_interval);
            loop {
                tokio::select! {
                    // check cancellation first so shutdown is prompt even
                    // with a tick pending
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match this.fetch_batch().await {
                            Ok(batch) => {
                                for envelope in batch {
                                    yield Ok(envelope);
                                }
                            }
                            Err(err) => yield Err(err),
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
