//! Queue consumer loop
//!
//! Fetches up to `prefetch` deliveries, hands them to the handler
//! concurrently and settles each one with the handler's verdict before
//! fetching again. Shutdown is only observed between batches, so in-flight
//! jobs always finish and get settled.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Delivery, JobQueue, QueueError};

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// What to do with a delivery once its handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Settlement;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub settle_failures: u64,
}

pub struct Consumer {
    queue: Arc<dyn JobQueue>,
    prefetch: usize,
    shutdown_rx: watch::Receiver<bool>,
    stats: ConsumerStats,
}

impl Consumer {
    pub fn new(queue: Arc<dyn JobQueue>, prefetch: usize, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            queue,
            prefetch: prefetch.max(1),
            shutdown_rx,
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run until shutdown is signalled or the queue connection is closed.
    pub async fn run(&mut self, handler: Arc<dyn DeliveryHandler>) -> Result<ConsumerStats, QueueError> {
        info!(prefetch = self.prefetch, "Starting queue consumer loop");
        let mut backoff = Duration::from_millis(500);

        loop {
            if self.shutdown_requested() {
                info!("Shutdown signal received, stopping consumer");
                break;
            }

            let fetched = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping consumer");
                        break;
                    }
                    continue;
                }
                fetched = self.queue.fetch(self.prefetch) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => {
                    backoff = Duration::from_millis(500);
                    batch
                }
                Err(QueueError::NotConnected) => {
                    warn!("Queue connection closed, stopping consumer");
                    break;
                }
                Err(e) => {
                    error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Queue fetch failed");
                    tokio::select! {
                        _ = self.shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            self.stats.received += batch.len() as u64;
            debug!(count = batch.len(), "Processing batch");

            let verdicts = join_all(batch.iter().map(|delivery| handler.handle(delivery))).await;

            for (delivery, verdict) in batch.iter().zip(verdicts) {
                self.settle(delivery, verdict).await;
            }
        }

        info!(
            received = self.stats.received,
            acked = self.stats.acked,
            dead_lettered = self.stats.dead_lettered,
            "Queue consumer stopped"
        );
        Ok(self.stats.clone())
    }

    async fn settle(&mut self, delivery: &Delivery, verdict: Settlement) {
        let result = match verdict {
            Settlement::Ack => self.queue.ack(delivery).await,
            Settlement::Nack { requeue } => self.queue.nack(delivery, requeue).await,
        };

        match (result, verdict) {
            (Ok(()), Settlement::Ack) => self.stats.acked += 1,
            (Ok(()), Settlement::Nack { requeue: true }) => self.stats.requeued += 1,
            (Ok(()), Settlement::Nack { requeue: false }) => self.stats.dead_lettered += 1,
            (Err(e), _) => {
                // Left unsettled; the broker redelivers it later
                self.stats.settle_failures += 1;
                error!(message_id = %delivery.id, error = %e, "Failed to settle message");
            }
        }
    }
}
