//! Redis Streams queue backend.
//!
//! Routing key = stream key. Workers read through a consumer group, so an
//! entry stays in the group's pending list until it is `XACK`ed. On startup a
//! consumer first re-reads its own pending entries (id `0`). Entries left
//! pending by consumers that no longer exist (a restarted container gets a new
//! name) are taken over with `XAUTOCLAIM` once idle for `claim_idle_ms`.
//!
//! Publishing waits for the entry to reach the append-only file (`WAITAOF`),
//! so an acknowledged publish survives a broker restart.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{dead_letter_key, Delivery, JobQueue, QueueError};

const PAYLOAD_FIELD: &str = "payload";
const ATTEMPT_FIELD: &str = "attempt";
const CURSOR_START: &str = "0-0";
const MAX_CLAIM_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RedisQueueConfig {
    pub url: String,
    pub routing_key: String,
    pub group: String,
    pub consumer: String,
    /// How long one fetch blocks waiting for new entries
    pub block_ms: u64,
    /// Minimum idle time before another consumer's pending entry is claimed
    pub claim_idle_ms: u64,
    pub require_aof: bool,
    pub aof_timeout_ms: u64,
}

/// Progress of the `XAUTOCLAIM` sweep over the group's pending list
struct ClaimSweep {
    cursor: String,
    finished_at: Option<Instant>,
}

pub struct RedisStreamQueue {
    config: RedisQueueConfig,
    /// Non-blocking commands (publish, settle, ping)
    commands: Mutex<Option<ConnectionManager>>,
    /// Dedicated to `XREADGROUP ... BLOCK` so reads never stall settles
    reader: Mutex<Option<ConnectionManager>>,
    pending_drained: AtomicBool,
    sweep: Mutex<ClaimSweep>,
    /// Broker persists writes to an AOF, so publishes wait for its fsync
    aof_enabled: bool,
}

impl RedisStreamQueue {
    /// Connect and make sure the stream and consumer group exist.
    pub async fn connect(config: RedisQueueConfig) -> Result<Self, QueueError> {
        let client = Client::open(config.url.as_str())?;
        let mut commands = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let reader = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let created: redis::RedisResult<()> = commands
            .xgroup_create_mkstream(&config.routing_key, &config.group, "0")
            .await;
        match created {
            Ok(()) => info!(
                stream = %config.routing_key,
                group = %config.group,
                "Created consumer group"
            ),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(group = %config.group, "Consumer group already exists")
            }
            Err(e) => return Err(e.into()),
        }

        let aof_enabled = match redis::cmd("CONFIG")
            .arg("GET")
            .arg("appendonly")
            .query_async::<_, Vec<String>>(&mut commands)
            .await
        {
            Ok(values) => values.get(1).is_some_and(|v| v == "yes"),
            Err(e) => {
                warn!(error = %e, "Could not read the broker's appendonly setting");
                false
            }
        };
        if !aof_enabled {
            if config.require_aof {
                return Err(QueueError::Connection(
                    "redis appendonly is disabled; published jobs would not survive a broker \
                     restart (set QUEUE_REQUIRE_AOF=false to accept that)"
                        .to_string(),
                ));
            }
            warn!("Redis appendonly is disabled; published jobs may be lost on broker restart");
        }

        info!(
            stream = %config.routing_key,
            group = %config.group,
            consumer = %config.consumer,
            aof = aof_enabled,
            "Redis stream queue connected"
        );

        Ok(Self {
            config,
            commands: Mutex::new(Some(commands)),
            reader: Mutex::new(Some(reader)),
            pending_drained: AtomicBool::new(false),
            sweep: Mutex::new(ClaimSweep {
                cursor: CURSOR_START.to_string(),
                finished_at: None,
            }),
            aof_enabled,
        })
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    async fn commands(&self) -> Result<ConnectionManager, QueueError> {
        self.commands
            .lock()
            .await
            .clone()
            .ok_or(QueueError::NotConnected)
    }

    async fn read_group(&self, id: &str, max: usize, block: bool) -> Result<Vec<Delivery>, QueueError> {
        let mut guard = self.reader.lock().await;
        let conn = guard.as_mut().ok_or(QueueError::NotConnected)?;

        let mut options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(max);
        if block {
            options = options.block(self.config.block_ms as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.routing_key], &[id], &options)
            .await?;

        let redelivered = id != ">";
        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| self.to_delivery(entry, redelivered))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Take over entries idle on any consumer of the group. One call advances
    /// the sweep by at most `max` entries; a finished sweep is repeated after
    /// `claim_idle_ms` (capped at a minute).
    async fn claim_stale(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut sweep = self.sweep.lock().await;
        if let Some(finished_at) = sweep.finished_at {
            let interval = Duration::from_millis(self.config.claim_idle_ms).min(MAX_CLAIM_INTERVAL);
            if finished_at.elapsed() < interval {
                return Ok(Vec::new());
            }
        }

        let mut conn = self.commands().await?;
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.routing_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(self.config.claim_idle_ms)
            .arg(&sweep.cursor)
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await?;
        let (next, entries) = parse_autoclaim(&reply)?;

        sweep.finished_at = (next == CURSOR_START).then(Instant::now);
        sweep.cursor = next;

        let claimed: Vec<Delivery> = entries
            .into_iter()
            .map(|entry| self.to_delivery(entry, true))
            .collect();
        if !claimed.is_empty() {
            warn!(
                count = claimed.len(),
                consumer = %self.config.consumer,
                "Claimed stale entries from other consumers"
            );
        }
        Ok(claimed)
    }

    fn to_delivery(&self, entry: StreamId, redelivered: bool) -> Delivery {
        // Entries trimmed from the stream come back with no fields; they get an
        // empty payload and are settled like any other unparseable message.
        let payload = entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default();
        let attempt = entry.get::<u32>(ATTEMPT_FIELD).unwrap_or(1);
        Delivery {
            id: entry.id,
            routing_key: self.config.routing_key.clone(),
            payload,
            attempt,
            redelivered,
        }
    }
}

#[async_trait]
impl JobQueue for RedisStreamQueue {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<String, QueueError> {
        if routing_key != self.config.routing_key {
            return Err(QueueError::Unroutable(routing_key.to_string()));
        }
        let mut conn = self.commands().await?;
        let id: String = conn
            .xadd(
                routing_key,
                "*",
                &[(PAYLOAD_FIELD, payload.to_vec()), (ATTEMPT_FIELD, b"1".to_vec())],
            )
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        if self.aof_enabled {
            let (local, _replicas): (i64, i64) = redis::cmd("WAITAOF")
                .arg(1)
                .arg(0)
                .arg(self.config.aof_timeout_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Publish(e.to_string()))?;
            if local < 1 {
                return Err(QueueError::Publish(format!(
                    "entry {id} was not fsynced within {}ms",
                    self.config.aof_timeout_ms
                )));
            }
        }
        Ok(id)
    }

    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let max = max.max(1);

        if !self.pending_drained.load(Ordering::SeqCst) {
            let pending = self.read_group("0", max, false).await?;
            if !pending.is_empty() {
                info!(count = pending.len(), "Redelivering pending stream entries");
                return Ok(pending);
            }
            self.pending_drained.store(true, Ordering::SeqCst);
        }

        let claimed = self.claim_stale(max).await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }

        self.read_group(">", max, true).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.commands().await?;
        let _: i64 = conn
            .xack(&delivery.routing_key, &self.config.group, &[&delivery.id])
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut conn = self.commands().await?;
        let (target, attempt) = if requeue {
            (delivery.routing_key.clone(), delivery.attempt + 1)
        } else {
            (dead_letter_key(&delivery.routing_key), delivery.attempt)
        };

        // Re-add and ack in one transaction so the entry is never lost or doubled
        redis::pipe()
            .atomic()
            .xadd(
                &target,
                "*",
                &[
                    (PAYLOAD_FIELD, delivery.payload.clone()),
                    (ATTEMPT_FIELD, attempt.to_string().into_bytes()),
                ],
            )
            .ignore()
            .xack(&delivery.routing_key, &self.config.group, &[&delivery.id])
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        if !requeue {
            warn!(
                message_id = %delivery.id,
                dead_letter = %target,
                "Message moved to dead-letter stream"
            );
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.commands().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.commands.lock().await.take();
        self.reader.lock().await.take();
        info!(stream = %self.config.routing_key, "Redis stream queue disconnected");
    }
}

/// `XAUTOCLAIM` replies `[next-cursor, [entries...], [deleted-ids...]]`.
fn parse_autoclaim(reply: &Value) -> Result<(String, Vec<StreamId>), QueueError> {
    match reply {
        Value::Bulk(items) if items.len() >= 2 => {
            let next: String = redis::from_redis_value(&items[0])?;
            let claimed: StreamRangeReply = redis::from_redis_value(&items[1])?;
            Ok((next, claimed.ids))
        }
        other => Err(QueueError::Connection(format!(
            "unexpected XAUTOCLAIM reply: {other:?}"
        ))),
    }
}
