use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::queue::{ExpireMessages, PromoteMessages, Queue, QueueError, SystemClock};

/// Outcome of one maintenance tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Scheduled messages promoted to ready.
    pub promoted: u64,
    /// Expired messages deleted.
    pub expired: u64,
}

/// A continuously running background task promoting due messages and
/// reaping expired ones.
///
/// Holds the receiver for per-tick reports and keeps the spawned background
/// task alive. Each tick is sent to `receiver` as `Ok(MaintenanceReport)`;
/// failures are sent as `Err(QueueError)` and the ticker keeps going, since
/// transient store errors resolve themselves on a later tick.
pub struct Maintenance {
    /// Receiver yielding one report or error per tick.
    pub receiver: mpsc::Receiver<Result<MaintenanceReport, QueueError>>,

    /// Handle to the background task. Kept private to ensure the task is
    /// alive as long as the `Maintenance` exists.
    _handle: JoinHandle<()>,
}

/// Builder for creating a [`Maintenance`] task.
///
/// Configures the tick interval and the report channel buffer size.
pub struct MaintenanceBuilder {
    interval: Duration,
    channel_size: usize,
}

impl MaintenanceBuilder {
    /// Create a new `MaintenanceBuilder` with the specified tick interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            channel_size: 16, // default channel size
        }
    }

    /// Set the channel buffer size for tick reports.
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }

    /// Start the maintenance task in the background.
    ///
    /// Each tick promotes due scheduled messages and deletes expired ones,
    /// both against the store's clock. The task stops when `cancel` is
    /// triggered or the report receiver is dropped.
    pub fn start<D>(self, queue: Queue<D>, cancel: CancellationToken) -> Maintenance
    where
        D: SystemClock + PromoteMessages + ExpireMessages + Clone + Send + Sync + 'static,
    {
        let (tx, receiver) = mpsc::channel(self.channel_size);
        let interval = self.interval;

        // Spawn a background task that ticks at the configured interval
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = run_tick(&queue).await;
                        if tx.send(report).await.is_err() {
                            // Receiver dropped, stop ticking
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });

        Maintenance {
            receiver,
            _handle: handle,
        }
    }
}

async fn run_tick<D>(queue: &Queue<D>) -> Result<MaintenanceReport, QueueError>
where
    D: SystemClock + PromoteMessages + ExpireMessages + Sync,
{
    let promoted = queue.promote_due().await?;
    let expired = queue.delete_expired().await?;
    Ok(MaintenanceReport { promoted, expired })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::queue::inmemory::InMemoryStore;

    #[tokio::test]
    async fn reports_promotions_and_expirations() {
        let store = InMemoryStore::default();
        let queue = Queue::new(store.queue("one"));
        let now = queue.system_time().await.unwrap();

        queue
            .send(
                Envelope::new("one", b"later".to_vec())
                    .schedule_after(chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        queue
            .send(
                Envelope::new("one", b"doomed".to_vec())
                    .deliver_by(now + chrono::Duration::minutes(30)),
            )
            .await
            .unwrap();

        store.advance_system_time(chrono::Duration::hours(2)).await;

        let cancel = CancellationToken::new();
        let mut maintenance =
            MaintenanceBuilder::new(Duration::from_millis(10)).start(queue.clone(), cancel.clone());

        let report = tokio::time::timeout(Duration::from_secs(1), maintenance.receiver.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(
            report,
            MaintenanceReport {
                promoted: 1,
                expired: 1
            }
        );
        assert_eq!(queue.ready_count().await.unwrap(), 1);
        assert_eq!(queue.scheduled_count().await.unwrap(), 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn quiet_ticks_report_zeroes() {
        let store = InMemoryStore::default();
        let queue = Queue::new(store.queue("one"));

        let cancel = CancellationToken::new();
        let mut maintenance =
            MaintenanceBuilder::new(Duration::from_millis(10)).start(queue, cancel.clone());

        let report = tokio::time::timeout(Duration::from_secs(1), maintenance.receiver.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(
            report,
            MaintenanceReport {
                promoted: 0,
                expired: 0
            }
        );

        cancel.cancel();
    }
}
