//! Durable-bus consumers.
//!
//! Every consumer follows the same contract:
//! - join a named consumer group on one durable channel
//! - parse each record into an envelope and hand it to the consumer
//! - a malformed record or a failing handler is logged, and the next record
//!   is still consumed
//! - a record is acknowledged only after it has been handled
//! - on shutdown, leave the group
//!
//! Delivery is at-least-once, so handlers must tolerate duplicates.

pub mod audit;
pub mod health;
pub mod metrics;
pub mod notification;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use horizon_events::{BusError, Channel, DurableBus, EventEnvelope, Record, Subscription};

pub use audit::{AuditRecord, AuditTrailConsumer, ComplianceReport};
pub use health::{AlertKind, HealthAlert, HealthMetric, HealthStatus, SystemHealthConsumer};
pub use metrics::{MetricSample, MetricsAggregator, MetricsSummary};
pub use notification::{
    InMemoryNotificationSink, JobNotification, JobNotificationConsumer, NotificationKind, NotificationSink,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl ConsumerError {
    pub fn invalid_payload(event_type: impl Into<String>, err: impl core::fmt::Display) -> Self {
        Self::InvalidPayload {
            event_type: event_type.into(),
            reason: err.to_string(),
        }
    }
}

/// A durable-bus consumer.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Consumer group to join.
    fn group(&self) -> &'static str;

    /// Channel to subscribe to.
    fn channel(&self) -> Channel;

    /// Process one envelope. Event types the consumer does not care about are
    /// ignored with `Ok(())`.
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ConsumerError>;
}

#[async_trait]
impl<C> Consumer for Arc<C>
where
    C: Consumer + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn group(&self) -> &'static str {
        (**self).group()
    }

    fn channel(&self) -> Channel {
        (**self).channel()
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ConsumerError> {
        (**self).handle(envelope).await
    }
}

/// Per-consumer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub processed: u64,
    pub failed: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control and join a running consumer.
pub struct ConsumerHandle {
    name: &'static str,
    channel: Channel,
    group: &'static str,
    member: String,
    bus: Arc<dyn DurableBus>,
    counters: Arc<Counters>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Stop consuming, wait for the task and leave the consumer group.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(consumer = self.name, error = %err, "consumer task ended abnormally");
            }
        }
        if let Err(err) = self.bus.leave_group(self.channel, self.group, &self.member).await {
            warn!(consumer = self.name, group = self.group, error = %err, "failed to leave consumer group");
        }
        info!(consumer = self.name, stats = ?self.counters.snapshot(), "consumer stopped");
    }
}

/// Runs consumers against a durable bus.
#[derive(Debug)]
pub struct ConsumerRunner;

impl ConsumerRunner {
    /// Join the consumer's group as `member` and process records on a task.
    pub async fn spawn<C>(consumer: Arc<C>, bus: Arc<dyn DurableBus>, member: &str) -> Result<ConsumerHandle, BusError>
    where
        C: Consumer + ?Sized,
    {
        let name = consumer.name();
        let channel = consumer.channel();
        let group = consumer.group();

        let subscription = bus.subscribe(channel, group, member).await?;
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let join = tokio::spawn(consume_loop(
            consumer,
            bus.clone(),
            subscription,
            shutdown_rx,
            counters.clone(),
        ));
        info!(consumer = name, channel = %channel, group, member, "consumer started");

        Ok(ConsumerHandle {
            name,
            channel,
            group,
            member: member.to_string(),
            bus,
            counters,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

async fn consume_loop<C>(
    consumer: Arc<C>,
    bus: Arc<dyn DurableBus>,
    mut subscription: Subscription<Record>,
    mut shutdown_rx: oneshot::Receiver<()>,
    counters: Arc<Counters>,
) where
    C: Consumer + ?Sized,
{
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            next = subscription.recv() => match next {
                Some(record) => {
                    process_record(consumer.as_ref(), &record, &counters).await;
                    acknowledge(bus.as_ref(), consumer.as_ref(), &record).await;
                }
                None => {
                    debug!(consumer = consumer.name(), "subscription closed");
                    break;
                }
            },
        }
    }
}

async fn process_record<C>(consumer: &C, record: &Record, counters: &Counters)
where
    C: Consumer + ?Sized,
{
    let envelope: EventEnvelope = match serde_json::from_str(&record.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(
                consumer = consumer.name(),
                channel = %record.channel,
                partition = record.partition,
                offset = %record.offset,
                error = %err,
                "skipping malformed record"
            );
            return;
        }
    };

    match consumer.handle(&envelope).await {
        Ok(()) => {
            counters.processed.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                consumer = consumer.name(),
                event_id = %envelope.event_id(),
                event_type = envelope.event_type(),
                error = %err,
                "consumer handler failed"
            );
        }
    }
}

/// Failed handlers are acknowledged too: the error is already contained and
/// a redelivery would fail the same way.
async fn acknowledge<C>(bus: &dyn DurableBus, consumer: &C, record: &Record)
where
    C: Consumer + ?Sized,
{
    if let Err(err) = bus.ack(consumer.group(), record).await {
        warn!(
            consumer = consumer.name(),
            channel = %record.channel,
            partition = record.partition,
            offset = %record.offset,
            error = %err,
            "ack failed; record stays pending"
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use super::{ConsumerHandle, ConsumerStats};

    /// Wait until the consumer has seen `count` records in total.
    pub async fn wait_for(handle: &ConsumerHandle, count: u64) -> ConsumerStats {
        for _ in 0..200 {
            let stats = handle.stats();
            if stats.processed + stats.failed + stats.malformed >= count {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stats()
    }
}
