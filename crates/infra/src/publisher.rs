//! Dual-bus event publisher.
//!
//! Every event goes to the transports its category calls for:
//!
//! | Category      | Ephemeral                          | Durable                        |
//! |---------------|------------------------------------|--------------------------------|
//! | job lifecycle | `job.events` (fan-out)             | `job-lifecycle` by `job_id`    |
//! | notification  | `notifications` by recipient       | none                           |
//! | metrics       | none                               | `job-metrics` by `job_id`      |
//! | audit         | none                               | `audit-trail` by `resource_id` |
//! | health        | none                               | `system-health` by `component` |
//!
//! Publishing never fails the caller. Each transport's result is reported in
//! a [`PublishOutcome`] and failures are logged. A transport that does not
//! answer within the publish timeout counts as failed.
//!
//! [`EventPublisher::supervise`] watches both buses and reconnects one that
//! drops, within the reconnect policy's attempt limit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use horizon_core::{CorrelationId, EventId, UserId};
use horizon_events::{
    BusError, BusHealth, Channel, DurableBus, EphemeralBus, Event, EventCategory, EventEnvelope, EventSchemaRegistry,
    Exchange, SchemaError, ValidationError,
};

use crate::event_bus::{ReconnectPolicy, connect_with_retry};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SUPERVISE_INTERVAL: Duration = Duration::from_secs(5);

const EPHEMERAL: &str = "ephemeral";
const DURABLE: &str = "durable";

/// Result of handing an event to one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    /// The durable bus had already stored this event id.
    Duplicate,
    /// The event's category does not use this transport.
    Skipped,
    Failed(String),
}

impl DeliveryStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, DeliveryStatus::Failed(_))
    }
}

/// Per-transport result of a publish. Callers are free to ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub event_id: EventId,
    pub ephemeral: DeliveryStatus,
    pub durable: DeliveryStatus,
    /// Schema violations. Non-empty means nothing was sent.
    pub rejected: Vec<ValidationError>,
}

impl PublishOutcome {
    fn skipped(event_id: EventId) -> Self {
        Self {
            event_id,
            ephemeral: DeliveryStatus::Skipped,
            durable: DeliveryStatus::Skipped,
            rejected: Vec::new(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        !self.rejected.is_empty()
    }

    /// No targeted transport failed and the event passed validation.
    pub fn is_success(&self) -> bool {
        !self.is_rejected() && !self.ephemeral.is_failed() && !self.durable.is_failed()
    }
}

/// Where an event goes on each bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub ephemeral: Option<(Exchange, Option<String>)>,
    pub durable: Option<(Channel, String)>,
}

impl Route {
    /// Route an envelope under the given category.
    ///
    /// Durable keys come from the channel's partition key field and fall back
    /// to the event id when the payload does not carry it.
    pub fn for_category(category: EventCategory, envelope: &EventEnvelope) -> Self {
        let durable = |channel: Channel| {
            let key = channel
                .spec()
                .partition_key
                .payload_field()
                .and_then(|field| envelope.payload_str(field))
                .map(str::to_string)
                .unwrap_or_else(|| envelope.event_id().to_string());
            Some((channel, key))
        };

        match category {
            EventCategory::JobLifecycle => Route {
                ephemeral: Some((Exchange::JobEvents, None)),
                durable: durable(Channel::JobLifecycle),
            },
            EventCategory::Notification => Route {
                ephemeral: Some((
                    Exchange::Notifications,
                    envelope.payload_str("recipient_user_id").map(str::to_string),
                )),
                durable: None,
            },
            EventCategory::Metrics => Route {
                ephemeral: None,
                durable: durable(Channel::JobMetrics),
            },
            EventCategory::Audit => Route {
                ephemeral: None,
                durable: durable(Channel::AuditTrail),
            },
            EventCategory::Health => Route {
                ephemeral: None,
                durable: durable(Channel::SystemHealth),
            },
        }
    }
}

/// Health of both transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherHealth {
    pub ephemeral: BusHealth,
    pub durable: BusHealth,
}

impl PublisherHealth {
    pub fn is_healthy(&self) -> bool {
        self.ephemeral.is_connected() && self.durable.is_connected()
    }
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Handle to the task started by [`EventPublisher::supervise`].
pub struct SupervisorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "bus supervisor ended abnormally");
            }
        }
    }
}

pub struct EventPublisher {
    ephemeral: Arc<dyn EphemeralBus>,
    durable: Arc<dyn DurableBus>,
    registry: Option<Arc<EventSchemaRegistry>>,
    reconnect: ReconnectPolicy,
    publish_timeout: Duration,
    counters: Counters,
    /// Bus name -> why reconnecting gave up. Such a bus is not retried.
    exhausted: Mutex<HashMap<&'static str, String>>,
    /// Serializes reconnect attempts.
    recovering: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl EventPublisher {
    pub fn new(ephemeral: Arc<dyn EphemeralBus>, durable: Arc<dyn DurableBus>) -> Self {
        Self {
            ephemeral,
            durable,
            registry: None,
            reconnect: ReconnectPolicy::default(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            counters: Counters::default(),
            exhausted: Mutex::new(HashMap::new()),
            recovering: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Validate payloads against the latest registered schema before sending.
    pub fn with_registry(mut self, registry: Arc<EventSchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Upper bound on each transport's publish call.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn ephemeral(&self) -> &Arc<dyn EphemeralBus> {
        &self.ephemeral
    }

    pub fn durable(&self) -> &Arc<dyn DurableBus> {
        &self.durable
    }

    /// Connect both buses (with retries) and declare their topology.
    ///
    /// A bus that stays unreachable is reported unhealthy; startup carries on.
    pub async fn start(&self) -> PublisherHealth {
        self.closed.store(false, Ordering::SeqCst);
        let _guard = self.recovering.lock().await;
        let ephemeral = self
            .bring_up(EPHEMERAL, || self.ephemeral.connect(), || self.ephemeral.ensure_topology())
            .await;
        let durable = self
            .bring_up(DURABLE, || self.durable.connect(), || self.durable.ensure_topology())
            .await;
        PublisherHealth { ephemeral, durable }
    }

    /// Current health. A bus the supervisor gave up on reports unhealthy.
    pub fn health(&self) -> PublisherHealth {
        PublisherHealth {
            ephemeral: self.bus_health(EPHEMERAL, self.ephemeral.health()),
            durable: self.bus_health(DURABLE, self.durable.health()),
        }
    }

    /// One supervision pass: reconnect any bus that is not connected.
    ///
    /// Each outage gets one run of the reconnect policy. A bus that stays
    /// down after the last attempt is reported unhealthy and left alone.
    pub async fn recover(&self) -> PublisherHealth {
        if self.closed.load(Ordering::SeqCst) {
            return self.health();
        }
        let _guard = self.recovering.lock().await;

        if self.needs_reconnect(EPHEMERAL, self.ephemeral.health()) {
            warn!(bus = EPHEMERAL, "bus down; reconnecting");
            self.bring_up(EPHEMERAL, || self.ephemeral.connect(), || self.ephemeral.ensure_topology())
                .await;
        }
        if self.needs_reconnect(DURABLE, self.durable.health()) {
            warn!(bus = DURABLE, "bus down; reconnecting");
            self.bring_up(DURABLE, || self.durable.connect(), || self.durable.ensure_topology())
                .await;
        }
        self.health()
    }

    /// Run [`recover`](Self::recover) every `interval` until stopped.
    pub fn supervise(self: &Arc<Self>, interval: Duration) -> SupervisorHandle {
        let publisher = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        publisher.recover().await;
                    }
                }
            }
            debug!("bus supervisor stopped");
        });

        SupervisorHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(err) = self.ephemeral.disconnect().await {
            warn!(bus = "ephemeral", error = %err, "disconnect failed");
        }
        if let Err(err) = self.durable.disconnect().await {
            warn!(bus = "durable", error = %err, "disconnect failed");
        }
        info!("event publisher shut down");
    }

    /// Publish an envelope, routed by the category of its event type.
    ///
    /// Unknown event types are not sent anywhere.
    pub async fn publish(&self, envelope: &EventEnvelope) -> PublishOutcome {
        match EventCategory::of(envelope.event_type()) {
            Some(category) => self.publish_as(category, envelope).await,
            None => {
                warn!(
                    event_id = %envelope.event_id(),
                    event_type = envelope.event_type(),
                    "no route for event type; dropping"
                );
                PublishOutcome::skipped(envelope.event_id())
            }
        }
    }

    /// Wrap a typed event in a fresh envelope and publish it.
    pub async fn publish_event<E>(&self, correlation_id: CorrelationId, user_id: UserId, event: E) -> PublishOutcome
    where
        E: Event + Serialize,
    {
        let category = event.category();
        let typed = EventEnvelope::for_event(correlation_id, user_id, event);
        match typed.to_json() {
            Ok(envelope) => self.publish_as(category, &envelope).await,
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = typed.event_type(), error = %err, "failed to serialize event");
                let reason = format!("serialization error: {err}");
                PublishOutcome {
                    event_id: typed.event_id(),
                    ephemeral: DeliveryStatus::Failed(reason.clone()),
                    durable: DeliveryStatus::Failed(reason),
                    rejected: Vec::new(),
                }
            }
        }
    }

    pub async fn publish_job_event(&self, envelope: &EventEnvelope) -> PublishOutcome {
        self.publish_as(EventCategory::JobLifecycle, envelope).await
    }

    pub async fn publish_notification(&self, envelope: &EventEnvelope) -> PublishOutcome {
        self.publish_as(EventCategory::Notification, envelope).await
    }

    pub async fn publish_metrics(&self, envelope: &EventEnvelope) -> PublishOutcome {
        self.publish_as(EventCategory::Metrics, envelope).await
    }

    pub async fn publish_audit(&self, envelope: &EventEnvelope) -> PublishOutcome {
        self.publish_as(EventCategory::Audit, envelope).await
    }

    pub async fn publish_health(&self, envelope: &EventEnvelope) -> PublishOutcome {
        self.publish_as(EventCategory::Health, envelope).await
    }

    #[instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id(), event_type = envelope.event_type())
    )]
    async fn publish_as(&self, category: EventCategory, envelope: &EventEnvelope) -> PublishOutcome {
        let mut outcome = PublishOutcome::skipped(envelope.event_id());

        let rejected = self.validate(envelope.event_type(), envelope.payload());
        if !rejected.is_empty() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(violations = rejected.len(), errors = ?rejected, "event failed schema validation; not published");
            outcome.rejected = rejected;
            return outcome;
        }

        let route = Route::for_category(category, envelope);

        let ephemeral = async {
            let Some((exchange, routing_key)) = &route.ephemeral else {
                return DeliveryStatus::Skipped;
            };
            let sent = tokio::time::timeout(
                self.publish_timeout,
                self.ephemeral.publish(*exchange, routing_key.as_deref(), envelope),
            )
            .await;
            match sent {
                Ok(Ok(())) => DeliveryStatus::Delivered,
                Ok(Err(err)) => {
                    warn!(bus = EPHEMERAL, exchange = %exchange, error = %err, "publish failed");
                    DeliveryStatus::Failed(err.to_string())
                }
                Err(_) => {
                    warn!(bus = EPHEMERAL, exchange = %exchange, timeout = ?self.publish_timeout, "publish timed out");
                    DeliveryStatus::Failed(format!("timed out after {:?}", self.publish_timeout))
                }
            }
        };

        let durable = async {
            let Some((channel, key)) = &route.durable else {
                return DeliveryStatus::Skipped;
            };
            let stored =
                tokio::time::timeout(self.publish_timeout, self.durable.publish(*channel, Some(key), envelope)).await;
            match stored {
                Ok(Ok(receipt)) if receipt.duplicate => {
                    debug!(channel = %channel, "event already stored");
                    DeliveryStatus::Duplicate
                }
                Ok(Ok(receipt)) => {
                    debug!(channel = %channel, partition = receipt.partition, "event stored");
                    DeliveryStatus::Delivered
                }
                Ok(Err(err)) => {
                    warn!(bus = DURABLE, channel = %channel, error = %err, "publish failed");
                    DeliveryStatus::Failed(err.to_string())
                }
                Err(_) => {
                    warn!(bus = DURABLE, channel = %channel, timeout = ?self.publish_timeout, "publish timed out");
                    DeliveryStatus::Failed(format!("timed out after {:?}", self.publish_timeout))
                }
            }
        };

        (outcome.ephemeral, outcome.durable) = tokio::join!(ephemeral, durable);

        if outcome.ephemeral.is_failed() || outcome.durable.is_failed() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.published.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Connect with retries, then declare topology. Records whether the
    /// policy was exhausted.
    async fn bring_up<C, CF, T, TF>(&self, bus: &'static str, connect: C, topology: T) -> BusHealth
    where
        C: FnMut() -> CF,
        CF: Future<Output = Result<(), BusError>>,
        T: FnOnce() -> TF,
        TF: Future<Output = Result<(), BusError>>,
    {
        let health = connect_with_retry(bus, &self.reconnect, connect).await;
        {
            let mut exhausted = self.exhausted.lock().unwrap_or_else(PoisonError::into_inner);
            match &health {
                BusHealth::Connected => {
                    exhausted.remove(bus);
                }
                BusHealth::Unhealthy { reason } => {
                    exhausted.insert(bus, reason.clone());
                }
                BusHealth::Disconnected => {}
            }
        }

        if health.is_connected() {
            if let Err(err) = topology().await {
                warn!(bus, error = %err, "failed to declare topology");
            }
        }
        health
    }

    fn needs_reconnect(&self, bus: &'static str, current: BusHealth) -> bool {
        !current.is_connected() && !self.exhausted.lock().unwrap_or_else(PoisonError::into_inner).contains_key(bus)
    }

    fn bus_health(&self, bus: &'static str, current: BusHealth) -> BusHealth {
        if current.is_connected() {
            return current;
        }
        match self.exhausted.lock().unwrap_or_else(PoisonError::into_inner).get(bus) {
            Some(reason) => BusHealth::Unhealthy { reason: reason.clone() },
            None => current,
        }
    }

    fn validate(&self, event_type: &str, payload: &JsonValue) -> Vec<ValidationError> {
        let Some(registry) = &self.registry else {
            return Vec::new();
        };
        match registry.validate_event(event_type, payload, None) {
            Ok(errors) => errors,
            Err(SchemaError::UnknownEventType(_)) => {
                debug!(event_type, "no schema registered; skipping validation");
                Vec::new()
            }
            Err(err) => {
                warn!(event_type, error = %err, "schema lookup failed; skipping validation");
                Vec::new()
            }
        }
    }
}
