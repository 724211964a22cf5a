//! Redis Streams-backed durable bus (at-least-once delivery).
//!
//! ## Layout
//!
//! - **Streams**: one per channel partition, `{prefix}:{channel}:{partition}`
//! - **Entry fields**: `event_id`, `event_type`, `partition_key`, `payload`
//!   (the serialized envelope)
//! - **Retention**: `XADD ... MINID ~` trims entries older than the channel
//!   retention on every append
//! - **Idempotency**: `SET NX PX` on `{prefix}:published:{event_id}` guards
//!   against appending the same event twice
//! - **Consumer groups**: created on every partition stream from offset `0`,
//!   so a new group replays the channel
//!
//! Each subscription runs a reader task with its own connection (blocking
//! `XREADGROUP` would stall a shared one). Entries stay pending until the
//! consumer calls [`DurableBus::ack`] after handling them.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::Value;
use redis::aio::MultiplexedConnection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use horizon_events::{BusError, BusHealth, Channel, DurableBus, EventEnvelope, PublishReceipt, Record, Subscription};

const DEFAULT_KEY_PREFIX: &str = "horizon";
const DEFAULT_READ_COUNT: usize = 10;
const DEFAULT_BLOCK_MS: u64 = 1000;
/// Pause after a failed read before trying again.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("not connected")]
    NotConnected,
}

impl From<RedisStreamsError> for BusError {
    fn from(err: RedisStreamsError) -> Self {
        match err {
            RedisStreamsError::Connection(msg) => BusError::Connection(msg),
            RedisStreamsError::Command(msg) => BusError::Publish(msg),
            RedisStreamsError::Serialization(msg) | RedisStreamsError::Deserialization(msg) => {
                BusError::Serialization(msg)
            }
            RedisStreamsError::NotConnected => BusError::Unavailable("durable bus not connected".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStreamsConfig {
    pub redis_url: String,
    pub key_prefix: String,
    /// Entries fetched per `XREADGROUP`.
    pub read_count: usize,
    pub block_ms: u64,
}

impl RedisStreamsConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            read_count: DEFAULT_READ_COUNT,
            block_ms: DEFAULT_BLOCK_MS,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn stream_key(&self, channel: Channel, partition: u32) -> String {
        format!("{}:{}:{}", self.key_prefix, channel.name(), partition)
    }

    fn dedup_key(&self, envelope: &EventEnvelope) -> String {
        format!("{}:published:{}", self.key_prefix, envelope.event_id())
    }

    fn topology_key(&self, channel: Channel) -> String {
        format!("{}:channels:{}", self.key_prefix, channel.name())
    }
}

type ReaderKey = (Channel, String, String);

pub struct RedisStreamsBus {
    client: redis::Client,
    config: RedisStreamsConfig,
    conn: Mutex<Option<MultiplexedConnection>>,
    health: Mutex<BusHealth>,
    readers: Mutex<HashMap<ReaderKey, oneshot::Sender<()>>>,
}

impl RedisStreamsBus {
    pub fn new(config: RedisStreamsConfig) -> Result<Self, RedisStreamsError> {
        let client =
            redis::Client::open(config.redis_url.as_str()).map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            config,
            conn: Mutex::new(None),
            health: Mutex::new(BusHealth::Disconnected),
            readers: Mutex::new(HashMap::new()),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, RedisStreamsError> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RedisStreamsError::NotConnected)
    }

    fn set_health(&self, health: BusHealth) {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = health;
    }

    /// A transport failure marks the bus unhealthy until the next `connect`.
    fn command_failed(&self, context: &str, err: redis::RedisError) -> RedisStreamsError {
        if err.is_io_error() || err.is_connection_dropped() {
            self.set_health(BusHealth::Unhealthy { reason: err.to_string() });
        }
        RedisStreamsError::Command(format!("{context} failed: {err}"))
    }

    /// Create every partition stream's consumer group (idempotent).
    async fn ensure_group(
        &self,
        conn: &mut MultiplexedConnection,
        channel: Channel,
        group: &str,
    ) -> Result<(), RedisStreamsError> {
        for partition in 0..channel.spec().partitions {
            let created: Result<String, _> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(self.config.stream_key(channel, partition))
                .arg(group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(conn)
                .await;
            group_created(created).map_err(|e| {
                warn!(channel = %channel, partition, group, error = %e, "failed to create consumer group");
                self.command_failed("XGROUP CREATE", e)
            })?;
        }
        Ok(())
    }

    fn stop_reader(&self, key: &ReaderKey) {
        let stopped = self.readers.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        if let Some(tx) = stopped {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl DurableBus for RedisStreamsBus {
    async fn connect(&self) -> Result<(), BusError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        *self.conn.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        self.set_health(BusHealth::Connected);
        info!(prefix = %self.config.key_prefix, "durable bus connected");
        Ok(())
    }

    /// Record each channel's spec under `{prefix}:channels:{name}`. Streams
    /// themselves are created lazily by the first append or group.
    async fn ensure_topology(&self) -> Result<(), BusError> {
        let mut conn = self.connection()?;
        for channel in Channel::ALL {
            let spec = channel.spec();
            let _: () = redis::cmd("HSET")
                .arg(self.config.topology_key(channel))
                .arg("partitions")
                .arg(spec.partitions)
                .arg("retention_days")
                .arg(spec.retention_days())
                .arg("partition_key")
                .arg(spec.partition_key.payload_field().unwrap_or("none"))
                .query_async(&mut conn)
                .await
                .map_err(|e| self.command_failed("HSET", e))?;
        }
        debug!("durable topology declared");
        Ok(())
    }

    #[instrument(
        skip(self, envelope),
        fields(channel = %channel, event_id = %envelope.event_id()),
        err
    )]
    async fn publish(
        &self,
        channel: Channel,
        key: Option<&str>,
        envelope: &EventEnvelope,
    ) -> Result<PublishReceipt, BusError> {
        let payload = serde_json::to_string(envelope).map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let event_id = envelope.event_id().to_string();
        let partition_key = key.unwrap_or(&event_id);
        let partition = channel.partition_for(partition_key);
        let spec = channel.spec();
        let retention_ms = spec.retention.as_millis() as u64;

        let mut conn = self.connection()?;

        let dedup_key = self.config.dedup_key(envelope);
        let fresh: Option<String> = redis::cmd("SET")
            .arg(&dedup_key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(retention_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_failed("SET NX", e))?;
        if fresh.is_none() {
            debug!("event already appended");
            return Ok(PublishReceipt {
                partition,
                offset: None,
                duplicate: true,
            });
        }

        let min_id = (chrono::Utc::now().timestamp_millis() as u64).saturating_sub(retention_ms);
        let appended: Result<String, _> = redis::cmd("XADD")
            .arg(self.config.stream_key(channel, partition))
            .arg("MINID")
            .arg("~")
            .arg(min_id)
            .arg("*")
            .arg("event_id")
            .arg(&event_id)
            .arg("event_type")
            .arg(envelope.event_type())
            .arg("partition_key")
            .arg(partition_key)
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await;

        match appended {
            Ok(offset) => Ok(PublishReceipt {
                partition,
                offset: Some(offset),
                duplicate: false,
            }),
            Err(err) => {
                // Release the guard so a retry can append.
                let _: Result<i64, _> = redis::cmd("DEL").arg(&dedup_key).query_async(&mut conn).await;
                Err(self.command_failed("XADD", err).into())
            }
        }
    }

    async fn subscribe(
        &self,
        channel: Channel,
        group: &str,
        consumer: &str,
    ) -> Result<Subscription<Record>, BusError> {
        let mut conn = self.connection()?;
        self.ensure_group(&mut conn, channel, group).await?;

        // Blocking reads get a connection of their own.
        let reader_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let key = (channel, group.to_string(), consumer.to_string());
        self.stop_reader(&key);
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, shutdown_tx);

        let reader = StreamReader {
            conn: reader_conn,
            config: self.config.clone(),
            channel,
            group: group.to_string(),
            consumer: consumer.to_string(),
        };
        tokio::spawn(reader.run(tx, shutdown_rx));

        debug!(channel = %channel, group, consumer, "joined consumer group");
        Ok(Subscription::new(rx))
    }

    async fn ack(&self, group: &str, record: &Record) -> Result<(), BusError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("XACK")
            .arg(self.config.stream_key(record.channel, record.partition))
            .arg(group)
            .arg(&record.offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_failed("XACK", e))?;
        Ok(())
    }

    async fn leave_group(&self, channel: Channel, group: &str, consumer: &str) -> Result<(), BusError> {
        self.stop_reader(&(channel, group.to_string(), consumer.to_string()));

        let mut conn = self.connection()?;
        for partition in 0..channel.spec().partitions {
            let _: i64 = redis::cmd("XGROUP")
                .arg("DELCONSUMER")
                .arg(self.config.stream_key(channel, partition))
                .arg(group)
                .arg(consumer)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.command_failed("XGROUP DELCONSUMER", e))?;
        }
        debug!(channel = %channel, group, consumer, "left consumer group");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let readers: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for tx in readers {
            let _ = tx.send(());
        }

        self.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.set_health(BusHealth::Disconnected);
        info!("durable bus disconnected");
        Ok(())
    }

    fn health(&self) -> BusHealth {
        self.health.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Reader task behind one subscription.
struct StreamReader {
    conn: MultiplexedConnection,
    config: RedisStreamsConfig,
    channel: Channel,
    group: String,
    consumer: String,
}

impl StreamReader {
    async fn run(mut self, tx: mpsc::UnboundedSender<Record>, mut shutdown_rx: oneshot::Receiver<()>) {
        let streams: Vec<String> = (0..self.channel.spec().partitions)
            .map(|p| self.config.stream_key(self.channel, p))
            .collect();

        loop {
            let reply = tokio::select! {
                _ = &mut shutdown_rx => break,
                reply = self.read(&streams) => reply,
            };

            let entries = match reply {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(channel = %self.channel, group = %self.group, error = %err, "stream read failed");
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                    continue;
                }
            };

            for entry in entries {
                let Some(partition) = partition_of(&entry.stream) else {
                    continue;
                };
                let record = Record {
                    channel: self.channel,
                    partition,
                    offset: entry.id.clone(),
                    key: entry.fields.get("partition_key").cloned(),
                    payload: entry.fields.get("payload").cloned().unwrap_or_default(),
                };
                if tx.send(record).is_err() {
                    debug!(channel = %self.channel, consumer = %self.consumer, "subscription dropped");
                    return;
                }
            }
        }
    }

    async fn read(&mut self, streams: &[String]) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.config.read_count)
            .arg("BLOCK")
            .arg(self.config.block_ms)
            .arg("STREAMS")
            .arg(streams);
        for _ in streams {
            cmd.arg(">");
        }

        let reply: Value = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;
        parse_read_reply(reply)
    }

}

/// `XGROUP CREATE` outcome. An existing group (BUSYGROUP) is fine.
fn group_created(result: Result<String, redis::RedisError>) -> Result<(), redis::RedisError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    stream: String,
    id: String,
    fields: HashMap<String, String>,
}

fn partition_of(stream_key: &str) -> Option<u32> {
    stream_key.rsplit(':').next()?.parse().ok()
}

fn bulk_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        Value::Status(status) => Some(status.clone()),
        _ => None,
    }
}

/// Parse an `XREADGROUP` reply:
/// `[[stream, [[id, [field, value, ...]], ...]], ...]`, or nil on timeout.
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, RedisStreamsError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => {
            return Err(RedisStreamsError::Deserialization(format!(
                "unexpected XREADGROUP reply: {other:?}"
            )));
        }
    };

    let mut entries = Vec::new();
    for stream in streams {
        let Value::Bulk(parts) = stream else {
            continue;
        };
        let (Some(name), Some(Value::Bulk(items))) = (parts.first().and_then(bulk_string), parts.get(1)) else {
            continue;
        };

        for item in items {
            let Value::Bulk(item) = item else {
                continue;
            };
            let Some(id) = item.first().and_then(bulk_string) else {
                continue;
            };
            let mut fields = HashMap::new();
            if let Some(Value::Bulk(kv)) = item.get(1) {
                for pair in kv.chunks(2) {
                    if let [k, v] = pair {
                        if let (Some(k), Some(v)) = (bulk_string(k), bulk_string(v)) {
                            fields.insert(k, v);
                        }
                    }
                }
            }
            entries.push(StreamEntry {
                stream: name.clone(),
                id,
                fields,
            });
        }
    }
    Ok(entries)
}
