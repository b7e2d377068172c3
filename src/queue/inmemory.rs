use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::envelope::{Envelope, MessageState};
use crate::outbox::inmemory::InMemoryOutbox;
use crate::queue::{
    ExpireMessages, InsertMessages, InspectMessages, PromoteMessages, QueueError, SystemClock,
    TransferOutgoing,
};

/// An in-memory message store for testing or local usage.
///
/// Holds the queue rows, the outgoing rows, and a manually controlled clock
/// behind one mutex, which stands in for the relational store's transaction
/// semantics: every operation that acquires the lock observes and produces
/// a consistent snapshot, including the outbox → queue move.
#[derive(Clone)]
pub struct InMemoryStore {
    pub(crate) inner: Arc<Mutex<StoreState>>,
}

pub(crate) struct StoreState {
    pub(crate) clock: DateTime<Utc>,
    pub(crate) sequence: u64,
    pub(crate) queue: HashMap<Uuid, QueueRow>,
    pub(crate) outgoing: Vec<Envelope>,
}

pub(crate) struct QueueRow {
    pub(crate) envelope: Envelope,
    pub(crate) state: MessageState,
    pub(crate) position: u64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreState {
                clock: Utc::now(),
                sequence: 0,
                queue: HashMap::new(),
                outgoing: Vec::new(),
            })),
        }
    }
}

impl InMemoryStore {
    /// Handle on a named queue within this store.
    pub fn queue(&self, destination: impl Into<String>) -> InMemoryQueue {
        InMemoryQueue {
            store: self.clone(),
            destination: destination.into(),
        }
    }

    /// Handle on this store's outbox.
    pub fn outbox(&self) -> InMemoryOutbox {
        InMemoryOutbox::new(self.clone())
    }

    /// Pin the store clock to an absolute moment.
    pub async fn set_system_time(&self, time: DateTime<Utc>) {
        self.inner.lock().await.clock = time;
    }

    /// Advance the store clock.
    pub async fn advance_system_time(&self, delta: Duration) {
        let mut state = self.inner.lock().await;
        state.clock = state.clock + delta;
    }
}

impl StoreState {
    pub(crate) fn insert_row(
        &mut self,
        envelope: &Envelope,
        state: MessageState,
    ) -> Result<(), QueueError> {
        if self.queue.contains_key(&envelope.id) {
            return Err(QueueError::duplicate_key());
        }
        self.sequence += 1;
        self.queue.insert(
            envelope.id,
            QueueRow {
                envelope: envelope.clone(),
                state,
                position: self.sequence,
            },
        );
        Ok(())
    }
}

/// Queue backend over an [`InMemoryStore`], bound to one destination.
#[derive(Clone)]
pub struct InMemoryQueue {
    store: InMemoryStore,
    destination: String,
}

#[async_trait]
impl SystemClock for InMemoryQueue {
    async fn system_time(&self) -> Result<DateTime<Utc>, QueueError> {
        Ok(self.store.inner.lock().await.clock)
    }
}

#[async_trait]
impl InsertMessages for InMemoryQueue {
    async fn insert_message(
        &self,
        envelope: &Envelope,
        state: MessageState,
    ) -> Result<(), QueueError> {
        let mut store = self.store.inner.lock().await;
        store.insert_row(envelope, state)
    }
}

#[async_trait]
impl InspectMessages for InMemoryQueue {
    async fn ready_count(&self) -> Result<u64, QueueError> {
        self.count_in_state(MessageState::Ready).await
    }

    async fn scheduled_count(&self) -> Result<u64, QueueError> {
        self.count_in_state(MessageState::Scheduled).await
    }

    async fn select_ready(&self, limit: u32) -> Result<Vec<Envelope>, QueueError> {
        let store = self.store.inner.lock().await;
        let mut rows: Vec<_> = store
            .queue
            .values()
            .filter(|row| {
                row.state == MessageState::Ready && row.envelope.destination == self.destination
            })
            .collect();
        rows.sort_by_key(|row| row.position);
        Ok(rows
            .into_iter()
            .take(limit as usize)
            .map(|row| row.envelope.clone())
            .collect())
    }
}

#[async_trait]
impl PromoteMessages for InMemoryQueue {
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut store = self.store.inner.lock().await;
        let mut promoted = 0;
        for row in store.queue.values_mut() {
            if row.state == MessageState::Scheduled
                && row.envelope.destination == self.destination
                && row.envelope.scheduled_time.is_some_and(|time| time <= now)
            {
                row.state = MessageState::Ready;
                promoted += 1;
            }
        }
        Ok(promoted)
    }
}

#[async_trait]
impl ExpireMessages for InMemoryQueue {
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut store = self.store.inner.lock().await;
        let before = store.queue.len();
        store.queue.retain(|_, row| {
            row.envelope.destination != self.destination || !row.envelope.is_expired(now)
        });
        Ok((before - store.queue.len()) as u64)
    }
}

#[async_trait]
impl TransferOutgoing for InMemoryQueue {
    async fn move_from_outgoing(
        &self,
        envelope: &Envelope,
        state: MessageState,
    ) -> Result<(), QueueError> {
        let mut store = self.store.inner.lock().await;
        let index = store
            .outgoing
            .iter()
            .position(|outgoing| outgoing.id == envelope.id)
            .ok_or_else(QueueError::not_found)?;
        if store.queue.contains_key(&envelope.id) {
            return Err(QueueError::duplicate_key());
        }
        store.outgoing.remove(index);
        store.insert_row(envelope, state)
    }
}

impl InMemoryQueue {
    async fn count_in_state(&self, state: MessageState) -> Result<u64, QueueError> {
        let store = self.store.inner.lock().await;
        Ok(store
            .queue
            .values()
            .filter(|row| row.state == state && row.envelope.destination == self.destination)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbox;
    use crate::queue::Queue;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap()
    }

    async fn queue_at(now: DateTime<Utc>) -> (InMemoryStore, Queue<InMemoryQueue>) {
        let store = InMemoryStore::default();
        store.set_system_time(now).await;
        let queue = Queue::new(store.queue("one"));
        (store, queue)
    }

    #[tokio::test]
    async fn send_without_delay_is_ready() {
        let (_store, queue) = queue_at(fixed_now()).await;

        queue
            .send(Envelope::new("one", b"payload".to_vec()))
            .await
            .unwrap();

        assert_eq!(queue.ready_count().await.unwrap(), 1);
        assert_eq!(queue.scheduled_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_with_future_delay_is_scheduled() {
        let (_store, queue) = queue_at(fixed_now()).await;

        queue
            .send(Envelope::new("one", b"payload".to_vec()).schedule_after(Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(queue.ready_count().await.unwrap(), 0);
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn send_with_past_schedule_is_ready() {
        let (_store, queue) = queue_at(fixed_now()).await;

        queue
            .send(
                Envelope::new("one", b"payload".to_vec())
                    .schedule_at(fixed_now() - Duration::hours(1)),
            )
            .await
            .unwrap();

        assert_eq!(queue.ready_count().await.unwrap(), 1);
        assert_eq!(queue.scheduled_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_send_keeps_a_single_row() {
        let (_store, queue) = queue_at(fixed_now()).await;
        let envelope = Envelope::new("one", b"payload".to_vec());

        queue.send(envelope.clone()).await.unwrap();
        queue.send(envelope).await.unwrap();

        assert_eq!(queue.ready_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn raw_insert_surfaces_the_duplicate() {
        let store = InMemoryStore::default();
        let backend = store.queue("one");
        let envelope = Envelope::new("one", b"payload".to_vec());

        backend
            .insert_message(&envelope, MessageState::Ready)
            .await
            .unwrap();
        let err = backend
            .insert_message(&envelope, MessageState::Ready)
            .await
            .unwrap_err();

        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn delete_expired_only_removes_past_deadlines() {
        let (_store, queue) = queue_at(fixed_now()).await;
        let now = queue.system_time().await.unwrap();

        queue
            .send(Envelope::new("one", b"a".to_vec()).deliver_by(now - Duration::hours(1)))
            .await
            .unwrap();
        queue
            .send(Envelope::new("one", b"b".to_vec()).deliver_by(now + Duration::hours(1)))
            .await
            .unwrap();
        queue
            .send(Envelope::new("one", b"c".to_vec()))
            .await
            .unwrap();

        assert_eq!(queue.ready_count().await.unwrap(), 3);

        let removed = queue.delete_expired().await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(queue.ready_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn messages_without_deadline_never_expire() {
        let (store, queue) = queue_at(fixed_now()).await;

        queue
            .send(Envelope::new("one", b"forever".to_vec()))
            .await
            .unwrap();
        store.advance_system_time(Duration::days(3650)).await;

        assert_eq!(queue.delete_expired().await.unwrap(), 0);
        assert_eq!(queue.ready_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_scheduled_messages_are_reaped_across_states() {
        let (store, queue) = queue_at(fixed_now()).await;
        let now = queue.system_time().await.unwrap();

        queue
            .send(
                Envelope::new("one", b"payload".to_vec())
                    .schedule_after(Duration::hours(2))
                    .deliver_by(now + Duration::hours(1)),
            )
            .await
            .unwrap();
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);

        store.advance_system_time(Duration::minutes(90)).await;

        assert_eq!(queue.delete_expired().await.unwrap(), 1);
        assert_eq!(queue.scheduled_count().await.unwrap(), 0);
        assert_eq!(queue.ready_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn promote_due_flips_due_messages_only() {
        let (store, queue) = queue_at(fixed_now()).await;

        queue
            .send(Envelope::new("one", b"payload".to_vec()).schedule_after(Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(queue.promote_due().await.unwrap(), 0);
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);

        store.advance_system_time(Duration::hours(2)).await;

        assert_eq!(queue.promote_due().await.unwrap(), 1);
        assert_eq!(queue.ready_count().await.unwrap(), 1);
        assert_eq!(queue.scheduled_count().await.unwrap(), 0);

        // already promoted, nothing left to flip
        assert_eq!(queue.promote_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn promotion_never_hides_a_message() {
        let (store, queue) = queue_at(fixed_now()).await;

        queue
            .send(Envelope::new("one", b"payload".to_vec()).schedule_after(Duration::minutes(5)))
            .await
            .unwrap();

        let total = queue.ready_count().await.unwrap() + queue.scheduled_count().await.unwrap();
        assert_eq!(total, 1);

        store.advance_system_time(Duration::minutes(10)).await;
        queue.promote_due().await.unwrap();

        let total = queue.ready_count().await.unwrap() + queue.scheduled_count().await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn move_from_outgoing_is_atomic() {
        let (store, queue) = queue_at(fixed_now()).await;
        let outbox = Outbox::new(store.outbox());

        let envelope = Envelope::new("one", b"payload".to_vec());
        outbox
            .store_outgoing([envelope.clone()], &mut ())
            .await
            .unwrap();

        assert_eq!(outbox.outstanding_count().await.unwrap(), 1);
        assert_eq!(queue.ready_count().await.unwrap(), 0);

        queue.move_from_outgoing(&envelope).await.unwrap();

        assert_eq!(outbox.outstanding_count().await.unwrap(), 0);
        assert_eq!(queue.ready_count().await.unwrap(), 1);

        let second = queue.move_from_outgoing(&envelope).await.unwrap_err();
        assert!(second.is_not_found());
        assert_eq!(outbox.outstanding_count().await.unwrap(), 0);
        assert_eq!(queue.ready_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn moved_scheduled_message_lands_scheduled() {
        let (store, queue) = queue_at(fixed_now()).await;
        let outbox = Outbox::new(store.outbox());

        let envelope =
            Envelope::new("one", b"payload".to_vec()).schedule_after(Duration::hours(1));
        outbox
            .store_outgoing([envelope.clone()], &mut ())
            .await
            .unwrap();

        queue.move_from_outgoing(&envelope).await.unwrap();

        assert_eq!(queue.ready_count().await.unwrap(), 0);
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn select_ready_returns_oldest_first_up_to_limit() {
        let (_store, queue) = queue_at(fixed_now()).await;

        let first = Envelope::new("one", b"a".to_vec());
        let second = Envelope::new("one", b"b".to_vec());
        let third = Envelope::new("one", b"c".to_vec());
        for envelope in [&first, &second, &third] {
            queue.send(envelope.clone()).await.unwrap();
        }

        let batch = queue.select_ready(2).await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, first.id);
        assert_eq!(batch[1].id, second.id);
    }

    #[tokio::test]
    async fn destinations_are_isolated() {
        let store = InMemoryStore::default();
        let one = Queue::new(store.queue("one"));
        let two = Queue::new(store.queue("two"));

        one.send(Envelope::new("one", b"payload".to_vec()))
            .await
            .unwrap();

        assert_eq!(one.ready_count().await.unwrap(), 1);
        assert_eq!(two.ready_count().await.unwrap(), 0);
    }
}
