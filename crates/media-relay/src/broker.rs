use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{self, AsyncCommands, cmd};
use deadpool_redis::{Connection, Pool};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use media_types::events::Topic;

/// Stream entry field that carries the JSON envelope.
pub const ENVELOPE_FIELD: &str = "envelope";

const STREAM_PREFIX: &str = "media";

/// Partition for a key: the first four bytes of its SHA-256, big-endian,
/// modulo the partition count. Equal keys always land on the same partition.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head % partitions.max(1)
}

/// Stream backing one partition of a topic: `media:<topic>:<partition>`.
pub fn stream_name(topic: Topic, partition: u32) -> String {
    format!("{STREAM_PREFIX}:{topic}:{partition}")
}

fn parse_stream_name(stream: &str) -> Result<(Topic, u32), BrokerError> {
    let malformed = || BrokerError::Protocol(format!("unexpected stream name {stream}"));

    let rest = stream
        .strip_prefix(STREAM_PREFIX)
        .and_then(|s| s.strip_prefix(':'))
        .ok_or_else(malformed)?;
    let (topic, partition) = rest.rsplit_once(':').ok_or_else(malformed)?;
    let topic = topic.parse().map_err(|_| malformed())?;
    let partition = partition.parse().map_err(|_| malformed())?;
    Ok((topic, partition))
}

fn topic_streams(topics: &[Topic]) -> Vec<String> {
    topics
        .iter()
        .flat_map(|&topic| (0..topic.partitions()).map(move |p| stream_name(topic, p)))
        .collect()
}

/// Where a sent record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub topic: Topic,
    pub partition: u32,
    pub id: String,
}

/// A record handed to a consumer. Must be acked once handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub topic: Topic,
    pub partition: u32,
    pub payload: String,
}

impl Delivery {
    pub fn stream(&self) -> String {
        stream_name(self.topic, self.partition)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("broker protocol error: {0}")]
    Protocol(String),
}

/// Partitioned, at-least-once log with consumer groups.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append `payload` to the partition of `topic` chosen by `key`.
    async fn send(&self, topic: Topic, key: &str, payload: &str) -> Result<Receipt, BrokerError>;

    /// Create the consumer group on every partition of `topics`. Records
    /// already on a partition are delivered to a newly created group.
    async fn ensure_group(&self, group: &str, topics: &[Topic]) -> Result<(), BrokerError>;

    /// Next undelivered records for the group, waiting up to `block` when
    /// none are available.
    async fn poll(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        max: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Records delivered to `consumer` earlier but never acked.
    async fn pending(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Take over records any consumer of the group received but left unacked
    /// for at least `min_idle`, e.g. a worker that crashed or restarted under
    /// a new name.
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        min_idle: Duration,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError>;
}

// -- Redis Streams --

/// Broker over Redis Streams, one stream per topic partition.
#[derive(Clone)]
pub struct RedisStreamBroker {
    pool: Pool,
    max_len: usize,
}

impl RedisStreamBroker {
    /// `max_len` caps each stream (approximate trimming on every append).
    pub fn new(pool: Pool, max_len: usize) -> Self {
        Self { pool, max_len }
    }

    async fn conn(&self) -> Result<Connection, BrokerError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for broker");
            BrokerError::Connection(e.to_string())
        })
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        from: &str,
        opts: StreamReadOptions,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let streams = topic_streams(topics);
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let ids = vec![from; streams.len()];
        let opts = opts.group(group, consumer);

        let mut conn = self.conn().await?;
        // BLOCK timeouts come back as nil.
        let reply: Option<StreamReadReply> = conn
            .xread_options(streams.as_slice(), ids.as_slice(), &opts)
            .await
            .map_err(command_error)?;

        let mut deliveries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            let (topic, partition) = parse_stream_name(&stream.key)?;
            for entry in stream.ids {
                // Entries trimmed while pending come back without fields.
                let payload = entry.get::<String>(ENVELOPE_FIELD).unwrap_or_default();
                deliveries.push(Delivery {
                    id: entry.id,
                    topic,
                    partition,
                    payload,
                });
            }
        }
        Ok(deliveries)
    }
}

fn command_error(e: redis::RedisError) -> BrokerError {
    BrokerError::Command(e.to_string())
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn send(&self, topic: Topic, key: &str, payload: &str) -> Result<Receipt, BrokerError> {
        let partition = partition_for(key, topic.partitions());
        let stream = stream_name(topic, partition);

        let mut conn = self.conn().await?;
        let id: String = cmd("XADD")
            .arg(&stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(ENVELOPE_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(Receipt {
            topic,
            partition,
            id,
        })
    }

    async fn ensure_group(&self, group: &str, topics: &[Topic]) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        for stream in topic_streams(topics) {
            let created: Result<(), redis::RedisError> = cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match created {
                Ok(()) => info!(stream = %stream, group, "Created consumer group"),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream = %stream, group, "Consumer group already exists");
                }
                Err(e) => return Err(command_error(e)),
            }
        }
        Ok(())
    }

    async fn poll(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        max: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let opts = StreamReadOptions::default()
            .block(block.as_millis() as usize)
            .count(max);
        self.read_group(group, consumer, topics, ">", opts).await
    }

    async fn pending(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let opts = StreamReadOptions::default().count(max);
        self.read_group(group, consumer, topics, "0", opts).await
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        min_idle: Duration,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self.conn().await?;
        let mut deliveries = Vec::new();
        for &topic in topics {
            for partition in 0..topic.partitions() {
                if deliveries.len() >= max {
                    return Ok(deliveries);
                }
                let stream = stream_name(topic, partition);
                let opts = StreamAutoClaimOptions::default().count(max - deliveries.len());
                let reply: StreamAutoClaimReply = conn
                    .xautoclaim_options(
                        &stream,
                        group,
                        consumer,
                        min_idle.as_millis() as u64,
                        "0-0",
                        opts,
                    )
                    .await
                    .map_err(command_error)?;

                if !reply.deleted_ids.is_empty() {
                    debug!(stream = %stream, count = reply.deleted_ids.len(), "Pending entries already trimmed");
                }
                for entry in reply.claimed {
                    let payload = entry.get::<String>(ENVELOPE_FIELD).unwrap_or_default();
                    deliveries.push(Delivery {
                        id: entry.id,
                        topic,
                        partition,
                        payload,
                    });
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .xack(delivery.stream(), group, &[&delivery.id])
            .await
            .map_err(command_error)?;
        Ok(())
    }
}

// -- In-memory --

#[derive(Debug, Clone)]
struct StoredRecord {
    id: String,
    payload: String,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

impl PendingEntry {
    fn new(consumer: &str) -> Self {
        Self {
            consumer: consumer.to_string(),
            delivered_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct GroupCursor {
    /// Index of the next undelivered record.
    next: usize,
    /// Delivered but unacked, by record id.
    pending: HashMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct MemoryState {
    seq: u64,
    streams: HashMap<String, Vec<StoredRecord>>,
    /// group -> stream -> cursor
    groups: HashMap<String, HashMap<String, GroupCursor>>,
}

/// In-process broker with the same partitioning and group semantics as the
/// Redis one. Used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    notify: Notify,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Payloads sent to `topic`, across all partitions, in send order.
    pub fn published(&self, topic: Topic) -> Vec<String> {
        let state = self.lock();
        let mut records: Vec<&StoredRecord> = (0..topic.partitions())
            .filter_map(|p| state.streams.get(&stream_name(topic, p)))
            .flatten()
            .collect();
        records.sort_by_key(|r| record_seq(&r.id));
        records.into_iter().map(|r| r.payload.clone()).collect()
    }

    /// Number of delivered-but-unacked records for a group.
    pub fn pending_count(&self, group: &str) -> usize {
        self.lock()
            .groups
            .get(group)
            .map(|streams| streams.values().map(|c| c.pending.len()).sum())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker unavailable".into()));
        }
        Ok(())
    }

    fn take_new(
        state: &mut MemoryState,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let MemoryState {
            streams, groups, ..
        } = state;
        let cursors = groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::Command(format!("NOGROUP no such group {group}")))?;

        let mut deliveries = Vec::new();
        for &topic in topics {
            for partition in 0..topic.partitions() {
                let stream = stream_name(topic, partition);
                let cursor = cursors.get_mut(&stream).ok_or_else(|| {
                    BrokerError::Command(format!("NOGROUP no such group {group} on {stream}"))
                })?;
                let records = streams.get(&stream).map(Vec::as_slice).unwrap_or_default();

                while cursor.next < records.len() && deliveries.len() < max {
                    let record = &records[cursor.next];
                    cursor.next += 1;
                    cursor.pending.insert(record.id.clone(), PendingEntry::new(consumer));
                    deliveries.push(Delivery {
                        id: record.id.clone(),
                        topic,
                        partition,
                        payload: record.payload.clone(),
                    });
                }
            }
        }
        Ok(deliveries)
    }
}

fn record_seq(id: &str) -> u64 {
    id.split_once('-')
        .and_then(|(seq, _)| seq.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn send(&self, topic: Topic, key: &str, payload: &str) -> Result<Receipt, BrokerError> {
        self.check_available()?;
        let partition = partition_for(key, topic.partitions());
        let id = {
            let mut state = self.lock();
            state.seq += 1;
            let id = format!("{}-0", state.seq);
            state
                .streams
                .entry(stream_name(topic, partition))
                .or_default()
                .push(StoredRecord {
                    id: id.clone(),
                    payload: payload.to_string(),
                });
            id
        };
        self.notify.notify_waiters();

        Ok(Receipt {
            topic,
            partition,
            id,
        })
    }

    async fn ensure_group(&self, group: &str, topics: &[Topic]) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.lock();
        let cursors = state.groups.entry(group.to_string()).or_default();
        for stream in topic_streams(topics) {
            cursors.entry(stream).or_default();
        }
        Ok(())
    }

    async fn poll(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        max: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        self.check_available()?;
        let notified = self.notify.notified();
        {
            let mut state = self.lock();
            let deliveries = Self::take_new(&mut state, group, consumer, topics, max)?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
        }

        if tokio::time::timeout(block, notified).await.is_err() {
            return Ok(Vec::new());
        }
        let mut state = self.lock();
        Self::take_new(&mut state, group, consumer, topics, max)
    }

    async fn pending(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        self.check_available()?;
        let state = self.lock();
        let Some(cursors) = state.groups.get(group) else {
            return Ok(Vec::new());
        };

        let mut deliveries = Vec::new();
        for &topic in topics {
            for partition in 0..topic.partitions() {
                let stream = stream_name(topic, partition);
                let (Some(cursor), Some(records)) = (cursors.get(&stream), state.streams.get(&stream))
                else {
                    continue;
                };
                for record in records {
                    if deliveries.len() >= max {
                        return Ok(deliveries);
                    }
                    if cursor.pending.get(&record.id).is_some_and(|p| p.consumer == consumer) {
                        deliveries.push(Delivery {
                            id: record.id.clone(),
                            topic,
                            partition,
                            payload: record.payload.clone(),
                        });
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        min_idle: Duration,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        self.check_available()?;
        let mut state = self.lock();
        let MemoryState {
            streams, groups, ..
        } = &mut *state;
        let Some(cursors) = groups.get_mut(group) else {
            return Err(BrokerError::Command(format!("NOGROUP no such group {group}")));
        };

        let mut deliveries = Vec::new();
        for &topic in topics {
            for partition in 0..topic.partitions() {
                let stream = stream_name(topic, partition);
                let (Some(cursor), Some(records)) = (cursors.get_mut(&stream), streams.get(&stream))
                else {
                    continue;
                };
                for record in records {
                    if deliveries.len() >= max {
                        return Ok(deliveries);
                    }
                    let Some(entry) = cursor.pending.get_mut(&record.id) else {
                        continue;
                    };
                    if entry.delivered_at.elapsed() < min_idle {
                        continue;
                    }
                    *entry = PendingEntry::new(consumer);
                    deliveries.push(Delivery {
                        id: record.id.clone(),
                        topic,
                        partition,
                        payload: record.payload.clone(),
                    });
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.lock();
        if let Some(cursor) = state
            .groups
            .get_mut(group)
            .and_then(|cursors| cursors.get_mut(&delivery.stream()))
        {
            cursor.pending.remove(&delivery.id);
        }
        Ok(())
    }
}
