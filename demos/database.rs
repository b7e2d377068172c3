use std::time::Duration;

use postbox::outbox::sqlx::SqlxOutbox;
use postbox::queue::maintenance::MaintenanceBuilder;
use postbox::queue::sqlx::SqlxQueue;
use postbox::{Envelope, Forwarder, Outbox, Queue};
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // Postgres connection
    let pool = PgPool::connect_with(PgConnectOptions::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let queue = Queue::new(SqlxQueue::try_new(pool.clone(), "demo").await.unwrap());

    let pool_clone = pool.clone();
    let cancel_outbox = cancel.clone();
    let outbox_handle = tokio::spawn(async move {
        let outbox = Outbox::new(SqlxOutbox::try_new(pool_clone.clone()).await.unwrap());

        let mut counter = 0u32;
        loop {
            let mut tx = pool_clone.begin().await.unwrap();
            let payload = format!("hello #{counter}").into_bytes();
            outbox
                .store_outgoing([Envelope::new("demo", payload)], &mut tx)
                .await
                .expect("Failed to store outgoing message");
            tx.commit().await.unwrap();
            counter += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if cancel_outbox.is_cancelled() {
                break;
            }
        }
    });

    let maintenance =
        MaintenanceBuilder::new(Duration::from_secs(1)).start(queue.clone(), cancel.clone());
    let maintenance_handle = tokio::spawn(async move {
        let mut maintenance = maintenance;
        while let Some(tick) = maintenance.receiver.recv().await {
            match tick {
                Ok(report) if report.promoted + report.expired > 0 => {
                    tracing::info!(
                        promoted = report.promoted,
                        expired = report.expired,
                        "Maintenance tick"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::error!(?err, "Maintenance tick failed"),
            }
        }
    });

    let forwarder_outbox = SqlxOutbox::new_uninitialized(pool.clone())
        .with_poll_interval(Duration::from_millis(500));
    let forwarder_handle = tokio::spawn(async move {
        Forwarder::new(forwarder_outbox, queue).run(cancel).await.unwrap();
    });

    tokio::try_join!(
        cancel_handle,
        outbox_handle,
        maintenance_handle,
        forwarder_handle
    )
    .unwrap();
}
