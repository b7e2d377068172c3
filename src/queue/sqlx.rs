use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::envelope::{Envelope, MessageState};
use crate::outbox::sqlx::{create_outgoing_table, OUTGOING_TABLE};
use crate::queue::{
    ExpireMessages, InsertMessages, InspectMessages, PromoteMessages, QueueError, SystemClock,
    TransferOutgoing,
};

pub(crate) const QUEUE_TABLE: &str = "queue_messages";

/// Postgres queue backend.
///
/// One value is bound to one destination queue; the tables are shared
/// across destinations. An optional schema qualifies the tables so
/// deployments and tests can be isolated through explicit configuration.
///
/// The database is the single time authority: scheduling and expiration
/// statements compare against timestamps read from `SELECT now()`.
#[derive(Clone)]
pub struct SqlxQueue {
    pool: PgPool,
    destination: String,
    schema: Option<String>,
}

impl SqlxQueue {
    /// Create a queue handle assuming an already-provisioned schema.
    pub fn new_uninitialized(pool: PgPool, destination: impl Into<String>) -> Self {
        Self {
            pool,
            destination: destination.into(),
            schema: None,
        }
    }

    /// Qualify the tables with an explicit schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Create a queue handle and ensure the tables exist.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool, destination: impl Into<String>) -> Result<Self, QueueError> {
        let queue = Self::new_uninitialized(pool, destination);
        queue.provision().await?;
        Ok(queue)
    }

    /// Create the schema and tables if they do not exist.
    pub async fn provision(&self) -> Result<(), QueueError> {
        if let Some(schema) = &self.schema {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .execute(&self.pool)
                .await?;
        }
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                destination TEXT NOT NULL,
                payload BYTEA NOT NULL,
                state TEXT NOT NULL,
                deliver_by TIMESTAMPTZ,
                scheduled_time TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.queue_table()
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS queue_messages_destination_state_idx
             ON {} (destination, state)",
            self.queue_table()
        ))
        .execute(&self.pool)
        .await?;
        create_outgoing_table(&self.pool, &self.outgoing_table()).await?;
        Ok(())
    }

    fn queue_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{QUEUE_TABLE}"),
            None => QUEUE_TABLE.to_string(),
        }
    }

    fn outgoing_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{OUTGOING_TABLE}"),
            None => OUTGOING_TABLE.to_string(),
        }
    }

    async fn count_in_state(&self, state: MessageState) -> Result<u64, QueueError> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE destination = $1 AND state = $2",
            self.queue_table()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(&self.destination)
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Decodes a queue or outgoing row into an [`Envelope`].
pub(crate) fn decode_envelope(row: &PgRow) -> Result<Envelope, sqlx::Error> {
    Ok(Envelope {
        id: row.try_get("id")?,
        destination: row.try_get("destination")?,
        payload: row.try_get("payload")?,
        deliver_by: row.try_get("deliver_by")?,
        scheduled_time: row.try_get("scheduled_time")?,
        schedule_delay: None,
    })
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return QueueError::duplicate_key();
            }
            let code = db.code().map(|code| code.into_owned());
            match code.as_deref() {
                // undefined_table, invalid_schema_name
                Some("42P01") | Some("3F000") => return QueueError::configuration(err.into()),
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => return QueueError::transient(err.into()),
                _ => {}
            }
        }
        match err {
            err @ (sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) => {
                QueueError::transient(err.into())
            }
            sqlx::Error::RowNotFound => QueueError::not_found(),
            err => QueueError::backend(err.into()),
        }
    }
}

#[async_trait]
impl SystemClock for SqlxQueue {
    /// Current timestamp as reported by the database server.
    async fn system_time(&self) -> Result<DateTime<Utc>, QueueError> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }
}

#[async_trait]
impl InsertMessages for SqlxQueue {
    async fn insert_message(
        &self,
        envelope: &Envelope,
        state: MessageState,
    ) -> Result<(), QueueError> {
        let sql = format!(
            "INSERT INTO {} (id, destination, payload, state, deliver_by, scheduled_time)
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.queue_table()
        );
        sqlx::query(&sql)
            .bind(envelope.id)
            .bind(&envelope.destination)
            .bind(envelope.payload.as_slice())
            .bind(state.as_str())
            .bind(envelope.deliver_by)
            .bind(envelope.scheduled_time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl InspectMessages for SqlxQueue {
    async fn ready_count(&self) -> Result<u64, QueueError> {
        self.count_in_state(MessageState::Ready).await
    }

    async fn scheduled_count(&self) -> Result<u64, QueueError> {
        self.count_in_state(MessageState::Scheduled).await
    }

    async fn select_ready(&self, limit: u32) -> Result<Vec<Envelope>, QueueError> {
        let sql = format!(
            "SELECT id, destination, payload, deliver_by, scheduled_time FROM {}
             WHERE destination = $1 AND state = $2 ORDER BY created_at LIMIT $3",
            self.queue_table()
        );
        let rows = sqlx::query(&sql)
            .bind(&self.destination)
            .bind(MessageState::Ready.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let envelopes = rows
            .iter()
            .map(decode_envelope)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(envelopes)
    }
}

#[async_trait]
impl PromoteMessages for SqlxQueue {
    /// One set-based UPDATE; concurrent readers see each row either
    /// scheduled or ready, never in between.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let sql = format!(
            "UPDATE {} SET state = $1
             WHERE destination = $2 AND state = $3 AND scheduled_time <= $4",
            self.queue_table()
        );
        let result = sqlx::query(&sql)
            .bind(MessageState::Ready.as_str())
            .bind(&self.destination)
            .bind(MessageState::Scheduled.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ExpireMessages for SqlxQueue {
    /// One set-based DELETE across states; rows without a deadline are
    /// untouched.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let sql = format!(
            "DELETE FROM {} WHERE destination = $1
             AND deliver_by IS NOT NULL AND deliver_by <= $2",
            self.queue_table()
        );
        let result = sqlx::query(&sql)
            .bind(&self.destination)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TransferOutgoing for SqlxQueue {
    async fn move_from_outgoing(
        &self,
        envelope: &Envelope,
        state: MessageState,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        let delete = format!("DELETE FROM {} WHERE id = $1", self.outgoing_table());
        let removed = sqlx::query(&delete)
            .bind(envelope.id)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            // dropping the transaction rolls it back
            return Err(QueueError::not_found());
        }

        let insert = format!(
            "INSERT INTO {} (id, destination, payload, state, deliver_by, scheduled_time)
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.queue_table()
        );
        sqlx::query(&insert)
            .bind(envelope.id)
            .bind(&envelope.destination)
            .bind(envelope.payload.as_slice())
            .bind(state.as_str())
            .bind(envelope.deliver_by)
            .bind(envelope.scheduled_time)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
