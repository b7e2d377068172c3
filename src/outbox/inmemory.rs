use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::outbox::{CountOutgoing, OutboxError, StoreOutgoing, StreamOutgoing};
use crate::queue::inmemory::InMemoryStore;

/// An in-memory outbox for testing or local usage.
///
/// Shares its [`InMemoryStore`] (and therefore its single lock) with the
/// queues created from the same store, so the outgoing → queue move stays
/// atomic.
#[derive(Clone)]
pub struct InMemoryOutbox {
    store: InMemoryStore,
}

impl InMemoryOutbox {
    pub(crate) fn new(store: InMemoryStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreOutgoing for InMemoryOutbox {
    type Transaction<'a> = ();

    /// Record envelopes as outgoing in insertion order.
    async fn store_outgoing(
        &self,
        envelopes: Vec<Envelope>,
        _tx: &mut Self::Transaction<'_>,
    ) -> Result<(), OutboxError> {
        let mut store = self.store.inner.lock().await;
        for envelope in envelopes {
            if store.outgoing.iter().any(|row| row.id == envelope.id) {
                return Err(OutboxError::duplicate_key());
            }
            store.outgoing.push(envelope);
        }
        Ok(())
    }
}

#[async_trait]
impl CountOutgoing for InMemoryOutbox {
    async fn outstanding_count(&self) -> Result<u64, OutboxError> {
        Ok(self.store.inner.lock().await.outgoing.len() as u64)
    }
}

#[async_trait]
impl StreamOutgoing for InMemoryOutbox {
    /// Stream a snapshot of the outgoing messages in insertion order.
    async fn messages(
        &self,
        _cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope, OutboxError>>, OutboxError> {
        let snapshot: Vec<_> = self
            .store
            .inner
            .lock()
            .await
            .outgoing
            .iter()
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(snapshot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    #[tokio::test]
    async fn recording_the_same_id_twice_is_rejected() {
        let store = InMemoryStore::default();
        let outbox = store.outbox();
        let envelope = Envelope::new("one", b"payload".to_vec());

        outbox
            .store_outgoing(vec![envelope.clone()], &mut ())
            .await
            .unwrap();
        let err = outbox
            .store_outgoing(vec![envelope], &mut ())
            .await
            .unwrap_err();

        assert!(err.is_duplicate_key());
        assert_eq!(outbox.outstanding_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn streams_outgoing_in_recording_order() {
        let store = InMemoryStore::default();
        let outbox = store.outbox();

        let first = Envelope::new("one", b"a".to_vec());
        let second = Envelope::new("one", b"b".to_vec());
        outbox
            .store_outgoing(vec![first.clone(), second.clone()], &mut ())
            .await
            .unwrap();

        let mut messages = outbox.messages(CancellationToken::new()).await.unwrap();

        assert_eq!(messages.next().await.unwrap().unwrap().id, first.id);
        assert_eq!(messages.next().await.unwrap().unwrap().id, second.id);
        assert!(messages.next().await.is_none());
    }
}
