//! In-memory buses for tests/dev.
//!
//! - No IO
//! - Topology is declared up front (same names as the broker-backed buses)
//! - `set_online(false)` simulates a broker outage

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use horizon_core::EventId;

use crate::bus::{
    BusError, BusHealth, Delivery, DurableBus, EphemeralBus, PublishReceipt, Record, Subscription,
};
use crate::envelope::EventEnvelope;
use crate::topology::{Channel, Exchange, QueueSpec, DEAD_LETTER_QUEUE, QUEUES};

fn poisoned() -> BusError {
    BusError::Unavailable("in-memory bus lock poisoned".to_string())
}

#[derive(Debug)]
struct QueueState {
    spec: &'static QueueSpec,
    consumers: Vec<UnboundedSender<Delivery>>,
    next_consumer: usize,
    backlog: VecDeque<(Instant, Delivery)>,
}

impl QueueState {
    fn new(spec: &'static QueueSpec) -> Self {
        Self {
            spec,
            consumers: Vec::new(),
            next_consumer: 0,
            backlog: VecDeque::new(),
        }
    }

    /// Drop expired backlog entries, returning them for dead-lettering.
    fn expire(&mut self, now: Instant) -> Vec<Delivery> {
        let mut expired = Vec::new();
        while let Some((queued_at, _)) = self.backlog.front() {
            if now.duration_since(*queued_at) <= self.spec.ttl {
                break;
            }
            if let Some((_, delivery)) = self.backlog.pop_front() {
                expired.push(delivery);
            }
        }
        expired
    }

    /// Hand a delivery to one live consumer (round robin) or park it.
    ///
    /// Returns deliveries that overflowed or expired.
    fn route(&mut self, delivery: Delivery, now: Instant) -> Vec<Delivery> {
        let mut dead = self.expire(now);
        let mut pending = delivery;

        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            match self.consumers[idx].send(pending) {
                Ok(()) => {
                    self.next_consumer = self.next_consumer.wrapping_add(1);
                    return dead;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(idx);
                    pending = returned;
                }
            }
        }

        self.backlog.push_back((now, pending));
        while self.backlog.len() > self.spec.max_length {
            if let Some((_, overflow)) = self.backlog.pop_front() {
                dead.push(overflow);
            }
        }
        dead
    }
}

/// In-memory ephemeral bus with exchange/queue semantics.
///
/// - Fanout exchanges copy to every bound queue
/// - Each queue load-balances across its consumers
/// - Messages wait in a queue (bounded by TTL and max length) until a consumer attaches
/// - Expired or overflowing messages go to the dead-letter queue
#[derive(Debug)]
pub struct InMemoryEphemeralBus {
    queues: Mutex<HashMap<&'static str, QueueState>>,
    online: AtomicBool,
    reachable: AtomicBool,
}

impl InMemoryEphemeralBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// When unreachable, `connect` fails and the bus goes offline.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.set_online(false);
        }
    }

    /// Messages waiting in a queue for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(queue).map_or(0, |s| s.backlog.len()))
            .unwrap_or(0)
    }

    fn declare(queues: &mut HashMap<&'static str, QueueState>) {
        for spec in QUEUES.iter() {
            queues.entry(spec.name).or_insert_with(|| QueueState::new(spec));
        }
    }

    fn dead_letter(queues: &mut HashMap<&'static str, QueueState>, dead: Vec<Delivery>, now: Instant) {
        let Some(dlq) = queues.get_mut(DEAD_LETTER_QUEUE) else {
            return;
        };
        for mut delivery in dead {
            debug!(
                event_id = %delivery.envelope.event_id(),
                from_exchange = %delivery.exchange,
                "dead-lettering message"
            );
            delivery.exchange = Exchange::DeadLetter;
            // Overflow of the dead-letter queue itself is dropped.
            let _ = dlq.route(delivery, now);
        }
    }
}

impl Default for InMemoryEphemeralBus {
    fn default() -> Self {
        let mut queues = HashMap::new();
        Self::declare(&mut queues);
        Self {
            queues: Mutex::new(queues),
            online: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl EphemeralBus for InMemoryEphemeralBus {
    async fn connect(&self) -> Result<(), BusError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BusError::Connection("ephemeral bus unreachable".to_string()));
        }
        self.set_online(true);
        Ok(())
    }

    async fn ensure_topology(&self) -> Result<(), BusError> {
        let mut queues = self.queues.lock().map_err(|_| poisoned())?;
        Self::declare(&mut queues);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: Option<&str>,
        envelope: &EventEnvelope,
    ) -> Result<(), BusError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("ephemeral bus offline".to_string()));
        }

        let now = Instant::now();
        let delivery = Delivery {
            exchange,
            routing_key: routing_key.map(str::to_string),
            envelope: envelope.clone(),
        };

        let mut queues = self.queues.lock().map_err(|_| poisoned())?;
        let bound: Vec<&'static str> = exchange.queues().map(|q| q.name).collect();

        let mut dead = Vec::new();
        if bound.is_empty() {
            dead.push(delivery);
        } else {
            for name in bound {
                if let Some(queue) = queues.get_mut(name) {
                    dead.extend(queue.route(delivery.clone(), now));
                }
            }
        }

        if exchange != Exchange::DeadLetter {
            Self::dead_letter(&mut queues, dead, now);
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription<Delivery>, BusError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("ephemeral bus offline".to_string()));
        }

        let now = Instant::now();
        let mut queues = self.queues.lock().map_err(|_| poisoned())?;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;

        let expired = state.expire(now);
        let (tx, rx) = mpsc::unbounded_channel();
        while let Some((_, delivery)) = state.backlog.pop_front() {
            // The receiver is alive; it is returned below.
            let _ = tx.send(delivery);
        }
        state.consumers.push(tx);

        if queue != DEAD_LETTER_QUEUE {
            Self::dead_letter(&mut queues, expired, now);
        }
        Ok(Subscription::new(rx))
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.set_online(false);
        let mut queues = self.queues.lock().map_err(|_| poisoned())?;
        for state in queues.values_mut() {
            state.consumers.clear();
        }
        Ok(())
    }

    fn health(&self) -> BusHealth {
        if self.online.load(Ordering::SeqCst) {
            BusHealth::Connected
        } else {
            BusHealth::Disconnected
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    offset: u64,
    appended_at: DateTime<Utc>,
    key: Option<String>,
    payload: String,
}

#[derive(Debug)]
struct Member {
    name: String,
    tx: UnboundedSender<Record>,
}

#[derive(Debug, Default)]
struct GroupState {
    members: Vec<Member>,
    backlog: VecDeque<Record>,
    acked: u64,
}

impl GroupState {
    /// Partition-affine dispatch: a partition always maps to the same member
    /// while membership is stable, which keeps per-key order.
    fn dispatch(&mut self, record: Record) {
        let mut pending = record;
        while !self.members.is_empty() {
            let idx = pending.partition as usize % self.members.len();
            match self.members[idx].tx.send(pending) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    self.members.remove(idx);
                    pending = returned;
                }
            }
        }
        self.backlog.push_back(pending);
    }
}

#[derive(Debug)]
struct ChannelState {
    partitions: Vec<VecDeque<StoredRecord>>,
    next_offsets: Vec<u64>,
    groups: HashMap<String, GroupState>,
}

impl ChannelState {
    fn new(channel: Channel) -> Self {
        let count = channel.spec().partitions as usize;
        Self {
            partitions: vec![VecDeque::new(); count],
            next_offsets: vec![0; count],
            groups: HashMap::new(),
        }
    }

    fn to_record(channel: Channel, partition: u32, stored: &StoredRecord) -> Record {
        Record {
            channel,
            partition,
            offset: stored.offset.to_string(),
            key: stored.key.clone(),
            payload: stored.payload.clone(),
        }
    }

    fn replay(&self, channel: Channel) -> VecDeque<Record> {
        let mut all: Vec<(DateTime<Utc>, Record)> = Vec::new();
        for (p, log) in self.partitions.iter().enumerate() {
            for stored in log {
                all.push((stored.appended_at, Self::to_record(channel, p as u32, stored)));
            }
        }
        all.sort_by_key(|(at, _)| *at);
        all.into_iter().map(|(_, r)| r).collect()
    }
}

#[derive(Debug)]
struct DurableState {
    channels: HashMap<Channel, ChannelState>,
    /// Event id -> when its dedup marker expires (the channel retention)
    published: HashMap<EventId, DateTime<Utc>>,
}

impl DurableState {
    fn prune_published(&mut self, now: DateTime<Utc>) {
        self.published.retain(|_, expires_at| *expires_at > now);
    }
}

/// In-memory durable bus: partitioned append-only logs with consumer groups.
///
/// - Publishing is idempotent per event id
/// - A new consumer group replays the channel from the beginning
/// - Records for a group with no members wait until a member joins
/// - Records older than the channel retention are pruned on append
#[derive(Debug)]
pub struct InMemoryDurableBus {
    state: Mutex<DurableState>,
    online: AtomicBool,
    reachable: AtomicBool,
}

impl InMemoryDurableBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// When unreachable, `connect` fails and the bus goes offline.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.set_online(false);
        }
    }

    /// Every retained record of a channel, oldest first.
    pub fn records(&self, channel: Channel) -> Vec<Record> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.channels.get(&channel).map(|c| c.replay(channel).into()))
            .unwrap_or_default()
    }

    /// Records a group has acknowledged so far.
    pub fn acknowledged(&self, channel: Channel, group: &str) -> u64 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.channels.get(&channel)?.groups.get(group).map(|g| g.acked))
            .unwrap_or(0)
    }

    fn ensure_online(&self) -> Result<(), BusError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("durable bus offline".to_string()))
        }
    }
}

impl Default for InMemoryDurableBus {
    fn default() -> Self {
        let channels = Channel::ALL
            .into_iter()
            .map(|c| (c, ChannelState::new(c)))
            .collect();
        Self {
            state: Mutex::new(DurableState {
                channels,
                published: HashMap::new(),
            }),
            online: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl DurableBus for InMemoryDurableBus {
    async fn connect(&self) -> Result<(), BusError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BusError::Connection("durable bus unreachable".to_string()));
        }
        self.set_online(true);
        Ok(())
    }

    async fn ensure_topology(&self) -> Result<(), BusError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        for channel in Channel::ALL {
            state
                .channels
                .entry(channel)
                .or_insert_with(|| ChannelState::new(channel));
        }
        Ok(())
    }

    async fn publish(
        &self,
        channel: Channel,
        key: Option<&str>,
        envelope: &EventEnvelope,
    ) -> Result<PublishReceipt, BusError> {
        self.ensure_online()?;

        let payload =
            serde_json::to_string(envelope).map_err(|e| BusError::Serialization(e.to_string()))?;
        let event_id = envelope.event_id();
        let partition = match key {
            Some(k) => channel.partition_for(k),
            None => channel.partition_for(&event_id.to_string()),
        };

        let spec = channel.spec();
        let now = Utc::now();

        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.prune_published(now);
        if state.published.contains_key(&event_id) {
            return Ok(PublishReceipt {
                partition,
                offset: None,
                duplicate: true,
            });
        }

        let channel_state = state
            .channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(channel));

        let p = partition as usize;
        let retention = chrono::Duration::from_std(spec.retention).ok();
        if let Some(retention) = retention {
            let cutoff = now - retention;
            let log = &mut channel_state.partitions[p];
            while log.front().is_some_and(|r| r.appended_at < cutoff) {
                log.pop_front();
            }
        }

        let offset = channel_state.next_offsets[p];
        channel_state.next_offsets[p] += 1;
        let stored = StoredRecord {
            offset,
            appended_at: now,
            key: key.map(str::to_string),
            payload,
        };
        let record = ChannelState::to_record(channel, partition, &stored);
        channel_state.partitions[p].push_back(stored);

        for group in channel_state.groups.values_mut() {
            group.dispatch(record.clone());
        }
        let expires_at = retention
            .and_then(|r| now.checked_add_signed(r))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.published.insert(event_id, expires_at);

        Ok(PublishReceipt {
            partition,
            offset: Some(offset.to_string()),
            duplicate: false,
        })
    }

    async fn subscribe(
        &self,
        channel: Channel,
        group: &str,
        consumer: &str,
    ) -> Result<Subscription<Record>, BusError> {
        self.ensure_online()?;

        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let channel_state = state
            .channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(channel));

        if !channel_state.groups.contains_key(group) {
            let backlog = channel_state.replay(channel);
            channel_state.groups.insert(
                group.to_string(),
                GroupState {
                    members: Vec::new(),
                    backlog,
                    acked: 0,
                },
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(group_state) = channel_state.groups.get_mut(group) {
            group_state.members.retain(|m| m.name != consumer);
            group_state.members.push(Member {
                name: consumer.to_string(),
                tx,
            });
            let waiting: Vec<Record> = group_state.backlog.drain(..).collect();
            for record in waiting {
                group_state.dispatch(record);
            }
        }

        debug!(channel = %channel, group, consumer, "joined consumer group");
        Ok(Subscription::new(rx))
    }

    async fn ack(&self, group: &str, record: &Record) -> Result<(), BusError> {
        self.ensure_online()?;
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(group_state) = state
            .channels
            .get_mut(&record.channel)
            .and_then(|c| c.groups.get_mut(group))
        {
            group_state.acked += 1;
        }
        Ok(())
    }

    async fn leave_group(&self, channel: Channel, group: &str, consumer: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(group_state) = state
            .channels
            .get_mut(&channel)
            .and_then(|c| c.groups.get_mut(group))
        {
            group_state.members.retain(|m| m.name != consumer);
        }
        debug!(channel = %channel, group, consumer, "left consumer group");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.set_online(false);
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        for channel_state in state.channels.values_mut() {
            for group in channel_state.groups.values_mut() {
                group.members.clear();
            }
        }
        Ok(())
    }

    fn health(&self) -> BusHealth {
        if self.online.load(Ordering::SeqCst) {
            BusHealth::Connected
        } else {
            BusHealth::Disconnected
        }
    }
}
