use crate::queue::{OrderQueue, QueuedMessage};
use crate::sync::{OrderSyncService, SyncReport};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, MissedTickBehavior, interval},
};
use tracing::{error, info, warn};

/// Spawn the poll/process pair: one task dequeues a batch per tick and
/// hands it over a channel to a worker that processes messages
/// sequentially, one order at a time.
pub fn spawn(
    service: Arc<OrderSyncService>,
    queue: Arc<dyn OrderQueue>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<QueuedMessage>>(8);

    let poller = tokio::spawn(async move {
        let mut ticker = interval(poll_interval_from_env());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let batch = queue.receive().await;
            if batch.is_empty() {
                continue;
            }
            info!(
                target = "stocksync.worker",
                batch = batch.len(),
                "pulled order notifications"
            );
            if tx.send(batch).await.is_err() {
                error!(
                    target = "stocksync.worker",
                    "worker channel closed, stopping poller"
                );
                break;
            }
        }
    });

    let worker = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            for message in batch {
                match service.process_message(&message).await {
                    Ok(SyncReport::Skipped { order_id }) => {
                        crate::metrics::sync_outcome("skipped");
                        info!(
                            target = "stocksync.worker",
                            order_id = %order_id,
                            "duplicate notification acknowledged"
                        );
                    }
                    Ok(SyncReport::Completed { order_id, updated }) => {
                        crate::metrics::sync_outcome("completed");
                        info!(
                            target = "stocksync.worker",
                            order_id = %order_id,
                            updated = updated,
                            "order synchronized"
                        );
                    }
                    Ok(SyncReport::SoftFailed { order_id, unsynced }) => {
                        crate::metrics::sync_outcome("soft_failed");
                        warn!(
                            target = "stocksync.worker",
                            order_id = %order_id,
                            unsynced = unsynced.len(),
                            "order recorded with unreconciled listings"
                        );
                    }
                    Err(err) => {
                        crate::metrics::sync_outcome("failed");
                        error!(
                            target = "stocksync.worker",
                            order_id = %message.order_id,
                            attempts = message.attempts,
                            stage = err.stage(),
                            error = %err,
                            "order processing failed, notification left for redelivery"
                        );
                    }
                }
            }
        }
    });

    (poller, worker)
}

fn poll_interval_from_env() -> Duration {
    let secs = std::env::var("POLL_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(60);
    Duration::from_secs(secs)
}
