//! In-process queue with the same settle semantics as the Redis backend.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{Delivery, JobQueue, QueueError};

#[derive(Default)]
struct State {
    ready: VecDeque<Delivery>,
    unacked: HashMap<String, Delivery>,
    dead_letters: Vec<Delivery>,
    next_id: u64,
    acked: u64,
}

pub struct InMemoryQueue {
    routing_key: String,
    poll_timeout: Duration,
    state: Mutex<State>,
    notify: Notify,
    connected: AtomicBool,
}

impl InMemoryQueue {
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            poll_timeout: Duration::from_millis(200),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            connected: AtomicBool::new(true),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn unacked_len(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    pub async fn acked_count(&self) -> u64 {
        self.state.lock().await.acked
    }

    pub async fn dead_letters(&self) -> Vec<Delivery> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Put every unsettled delivery back, as a broker does when a consumer's
    /// connection drops.
    pub async fn recover_unacked(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut recovered: Vec<Delivery> = state.unacked.drain().map(|(_, d)| d).collect();
        recovered.sort_by(|a, b| a.id.cmp(&b.id));
        let count = recovered.len();
        for mut delivery in recovered.into_iter().rev() {
            delivery.redelivered = true;
            state.ready.push_front(delivery);
        }
        drop(state);
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::NotConnected)
        }
    }

    async fn push(&self, payload: Vec<u8>, attempt: u32) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("{:020}", state.next_id);
        state.ready.push_back(Delivery {
            id: id.clone(),
            routing_key: self.routing_key.clone(),
            payload,
            attempt,
            redelivered: false,
        });
        drop(state);
        self.notify.notify_one();
        id
    }

    async fn take_unacked(&self, delivery: &Delivery) -> Result<Delivery, QueueError> {
        self.state
            .lock()
            .await
            .unacked
            .remove(&delivery.id)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id.clone()))
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<String, QueueError> {
        self.ensure_connected()?;
        if routing_key != self.routing_key {
            return Err(QueueError::Unroutable(routing_key.to_string()));
        }
        Ok(self.push(payload.to_vec(), 1).await)
    }

    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let max = max.max(1);
        let deadline = tokio::time::Instant::now() + self.poll_timeout;

        loop {
            self.ensure_connected()?;
            {
                let mut state = self.state.lock().await;
                if !state.ready.is_empty() {
                    let take = max.min(state.ready.len());
                    let batch: Vec<Delivery> = state.ready.drain(..take).collect();
                    for delivery in &batch {
                        state.unacked.insert(delivery.id.clone(), delivery.clone());
                    }
                    return Ok(batch);
                }
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.take_unacked(delivery).await?;
        self.state.lock().await.acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let delivery = self.take_unacked(delivery).await?;
        if requeue {
            self.push(delivery.payload, delivery.attempt + 1).await;
        } else {
            self.state.lock().await.dead_letters.push(delivery);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.ensure_connected()
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
