//! Bus abstractions for the two transports events travel over.
//!
//! - **Ephemeral bus**: low-latency fan-out to live listeners. Nothing is
//!   replayable; undeliverable messages are routed to a dead-letter exchange.
//! - **Durable bus**: partitioned, replayable log with consumer groups. Records
//!   sharing a partition key are delivered in publish order.
//!
//! Both are **at-least-once**: consumers must tolerate duplicates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

use crate::envelope::EventEnvelope;
use crate::topology::{Channel, Exchange};

/// A subscription to a bus.
///
/// Owned by a single consumer task. The stream ends (`recv` returns `None`)
/// when the bus side is dropped or the consumer left its group.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for up to `timeout`. `Ok(None)` means the stream ended.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<M>, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.receiver.recv()).await
    }
}

/// Transport failure on either bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BusHealth {
    Connected,
    Disconnected,
    Unhealthy { reason: String },
}

impl BusHealth {
    pub fn is_connected(&self) -> bool {
        matches!(self, BusHealth::Connected)
    }
}

/// Message as received from an ephemeral queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub exchange: Exchange,
    pub routing_key: Option<String>,
    pub envelope: EventEnvelope,
}

/// Record as received from a durable channel.
///
/// The payload is the raw serialized envelope; consumers parse it and decide
/// what to do with malformed records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub channel: Channel,
    pub partition: u32,
    pub offset: String,
    pub key: Option<String>,
    pub payload: String,
}

/// Acknowledgement of a durable publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub partition: u32,
    pub offset: Option<String>,
    /// The event id was already published; nothing was appended.
    pub duplicate: bool,
}

#[async_trait]
pub trait EphemeralBus: Send + Sync {
    async fn connect(&self) -> Result<(), BusError>;

    /// Declare exchanges, queues and bindings. Existing entities are fine.
    async fn ensure_topology(&self) -> Result<(), BusError>;

    /// Publish to an exchange. Direct exchanges use `routing_key` to target a
    /// recipient; `None` broadcasts to every bound queue.
    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: Option<&str>,
        envelope: &EventEnvelope,
    ) -> Result<(), BusError>;

    /// Attach a consumer to a named queue.
    async fn subscribe(&self, queue: &str) -> Result<Subscription<Delivery>, BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;

    fn health(&self) -> BusHealth;
}

#[async_trait]
pub trait DurableBus: Send + Sync {
    async fn connect(&self) -> Result<(), BusError>;

    /// Create channels with their partition counts. Existing channels are fine.
    async fn ensure_topology(&self) -> Result<(), BusError>;

    /// Append to a channel. The same event id is never appended twice.
    async fn publish(
        &self,
        channel: Channel,
        key: Option<&str>,
        envelope: &EventEnvelope,
    ) -> Result<PublishReceipt, BusError>;

    /// Join `group` as `consumer`. A new group starts at the beginning of the channel.
    async fn subscribe(
        &self,
        channel: Channel,
        group: &str,
        consumer: &str,
    ) -> Result<Subscription<Record>, BusError>;

    /// Mark a delivered record as handled by `group`. A record that is never
    /// acknowledged stays pending and may be delivered again.
    async fn ack(&self, group: &str, record: &Record) -> Result<(), BusError>;

    async fn leave_group(&self, channel: Channel, group: &str, consumer: &str) -> Result<(), BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;

    fn health(&self) -> BusHealth;
}

#[async_trait]
impl<B> EphemeralBus for Arc<B>
where
    B: EphemeralBus + ?Sized,
{
    async fn connect(&self) -> Result<(), BusError> {
        (**self).connect().await
    }

    async fn ensure_topology(&self) -> Result<(), BusError> {
        (**self).ensure_topology().await
    }

    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: Option<&str>,
        envelope: &EventEnvelope,
    ) -> Result<(), BusError> {
        (**self).publish(exchange, routing_key, envelope).await
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription<Delivery>, BusError> {
        (**self).subscribe(queue).await
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        (**self).disconnect().await
    }

    fn health(&self) -> BusHealth {
        (**self).health()
    }
}

#[async_trait]
impl<B> DurableBus for Arc<B>
where
    B: DurableBus + ?Sized,
{
    async fn connect(&self) -> Result<(), BusError> {
        (**self).connect().await
    }

    async fn ensure_topology(&self) -> Result<(), BusError> {
        (**self).ensure_topology().await
    }

    async fn publish(
        &self,
        channel: Channel,
        key: Option<&str>,
        envelope: &EventEnvelope,
    ) -> Result<PublishReceipt, BusError> {
        (**self).publish(channel, key, envelope).await
    }

    async fn subscribe(
        &self,
        channel: Channel,
        group: &str,
        consumer: &str,
    ) -> Result<Subscription<Record>, BusError> {
        (**self).subscribe(channel, group, consumer).await
    }

    async fn ack(&self, group: &str, record: &Record) -> Result<(), BusError> {
        (**self).ack(group, record).await
    }

    async fn leave_group(&self, channel: Channel, group: &str, consumer: &str) -> Result<(), BusError> {
        (**self).leave_group(channel, group, consumer).await
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        (**self).disconnect().await
    }

    fn health(&self) -> BusHealth {
        (**self).health()
    }
}
