//! Redis pub/sub-backed ephemeral bus.
//!
//! Exchanges map onto pub/sub channels: `{prefix}:{exchange}` for broadcasts
//! and `{prefix}:{exchange}:{routing_key}` for targeted messages. Pub/sub is
//! not durable; a message nobody is listening for is pushed onto the
//! dead-letter list `{prefix}:job-dlq` (bounded and expiring like the queue).
//!
//! Every subscriber to a queue receives every message bound for it; there is
//! no load balancing across subscribers of the same queue.

use std::sync::{Mutex, PoisonError};
use std::thread;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use horizon_events::topology::{DEAD_LETTER_QUEUE, queue};
use horizon_events::{BusError, BusHealth, Delivery, EphemeralBus, EventEnvelope, Exchange, Subscription};

pub struct RedisPubSubBus {
    client: redis::Client,
    prefix: String,
    conn: Mutex<Option<MultiplexedConnection>>,
    health: Mutex<BusHealth>,
}

impl RedisPubSubBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            conn: Mutex::new(None),
            health: Mutex::new(BusHealth::Disconnected),
        })
    }

    fn channel_name(&self, exchange: Exchange, routing_key: Option<&str>) -> String {
        match routing_key {
            Some(key) => format!("{}:{}:{}", self.prefix, exchange.name(), key),
            None => format!("{}:{}", self.prefix, exchange.name()),
        }
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:{}", self.prefix, DEAD_LETTER_QUEUE)
    }

    fn connection(&self) -> Result<MultiplexedConnection, BusError> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BusError::Unavailable("ephemeral bus not connected".to_string()))
    }

    fn set_health(&self, health: BusHealth) {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = health;
    }

    fn command_failed(&self, context: &str, err: redis::RedisError) -> BusError {
        if err.is_io_error() || err.is_connection_dropped() {
            self.set_health(BusHealth::Unhealthy { reason: err.to_string() });
        }
        BusError::Publish(format!("{context} failed: {err}"))
    }

    async fn dead_letter(&self, conn: &mut MultiplexedConnection, payload: &str) -> Result<(), BusError> {
        let Some(spec) = queue(DEAD_LETTER_QUEUE) else {
            return Ok(());
        };
        let key = self.dead_letter_key();
        redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(spec.max_length.saturating_sub(1))
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(spec.ttl.as_millis() as u64)
            .ignore()
            .query_async::<_, ()>(conn)
            .await
            .map_err(|e| self.command_failed("dead-letter push", e))
    }
}

fn parse_channel(prefix: &str, channel: &str) -> Option<(Exchange, Option<String>)> {
    let rest = channel.strip_prefix(prefix)?.strip_prefix(':')?;
    let (name, key) = match rest.split_once(':') {
        Some((name, key)) => (name, Some(key.to_string())),
        None => (rest, None),
    };
    let exchange = Exchange::ALL.into_iter().find(|e| e.name() == name)?;
    Some((exchange, key))
}

#[async_trait]
impl EphemeralBus for RedisPubSubBus {
    async fn connect(&self) -> Result<(), BusError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        *self.conn.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        self.set_health(BusHealth::Connected);
        info!(prefix = %self.prefix, "ephemeral bus connected");
        Ok(())
    }

    /// Pub/sub channels need no declaration.
    async fn ensure_topology(&self) -> Result<(), BusError> {
        self.connection().map(|_| ())
    }

    #[instrument(skip(self, envelope), fields(event_id = %envelope.event_id()), err)]
    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: Option<&str>,
        envelope: &EventEnvelope,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_string(envelope).map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.channel_name(exchange, routing_key))
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_failed("PUBLISH", e))?;

        if receivers == 0 && exchange != Exchange::DeadLetter {
            debug!(exchange = %exchange, "no listeners; dead-lettering message");
            self.dead_letter(&mut conn, &payload).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, queue_name: &str) -> Result<Subscription<Delivery>, BusError> {
        let spec = queue(queue_name).ok_or_else(|| BusError::UnknownQueue(queue_name.to_string()))?;
        let pattern = format!("{}:{}*", self.prefix, spec.exchange.name());

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let prefix = self.prefix.clone();
        let queue_name = queue_name.to_string();

        // Background thread that receives pub/sub messages and forwards them.
        thread::Builder::new()
            .name(format!("pubsub-{queue_name}"))
            .spawn(move || {
                let mut conn = match client.get_connection() {
                    Ok(c) => c,
                    Err(err) => {
                        warn!(queue = %queue_name, error = %err, "pub/sub connection failed");
                        return;
                    }
                };

                let mut pubsub = conn.as_pubsub();
                if let Err(err) = pubsub.psubscribe(&pattern) {
                    warn!(queue = %queue_name, error = %err, "pub/sub subscribe failed");
                    return;
                }

                loop {
                    let msg = match pubsub.get_message() {
                        Ok(m) => m,
                        Err(err) => {
                            warn!(queue = %queue_name, error = %err, "pub/sub stream ended");
                            return;
                        }
                    };

                    let Some((exchange, routing_key)) = parse_channel(&prefix, msg.get_channel_name()) else {
                        continue;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let envelope: EventEnvelope = match serde_json::from_str(&payload) {
                        Ok(e) => e,
                        Err(err) => {
                            warn!(queue = %queue_name, error = %err, "skipping malformed message");
                            continue;
                        }
                    };

                    let delivery = Delivery {
                        exchange,
                        routing_key,
                        envelope,
                    };
                    if tx.send(delivery).is_err() {
                        return;
                    }
                }
            })
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        Ok(Subscription::new(rx))
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.set_health(BusHealth::Disconnected);
        info!("ephemeral bus disconnected");
        Ok(())
    }

    fn health(&self) -> BusHealth {
        self.health.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        let bus = RedisPubSubBus::new("redis://localhost", "horizon").unwrap();

        let broadcast = bus.channel_name(Exchange::JobEvents, None);
        assert_eq!(broadcast, "horizon:job.events");
        assert_eq!(parse_channel("horizon", &broadcast), Some((Exchange::JobEvents, None)));

        let targeted = bus.channel_name(Exchange::Notifications, Some("u1"));
        assert_eq!(
            parse_channel("horizon", &targeted),
            Some((Exchange::Notifications, Some("u1".to_string())))
        );
        assert_eq!(parse_channel("other", &targeted), None);
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let bus = RedisPubSubBus::new("redis://localhost", "horizon").unwrap();
        assert!(matches!(
            bus.subscribe("no-such-queue").await,
            Err(BusError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn publish_before_connect_is_unavailable() {
        let bus = RedisPubSubBus::new("redis://localhost", "horizon").unwrap();
        let envelope = EventEnvelope::new(
            "job.submitted",
            horizon_core::CorrelationId::new(),
            horizon_core::UserId::from("u1"),
            serde_json::json!({}),
        );
        assert!(matches!(
            bus.publish(Exchange::JobEvents, None, &envelope).await,
            Err(BusError::Unavailable(_))
        ));
    }
}
