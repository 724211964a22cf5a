//! Fixed bus topology: durable channels, ephemeral exchanges/queues, consumer groups.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Durable (replayable, partitioned) channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    JobLifecycle,
    JobMetrics,
    Notifications,
    AuditTrail,
    SystemHealth,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Light compression for high-volume channels.
    Snappy,
    /// Fast compression for latency-sensitive channels.
    Lz4,
}

/// Which payload field orders a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKey {
    JobId,
    ResourceId,
    ComponentId,
    Unkeyed,
}

impl PartitionKey {
    /// Payload field carrying the key, if any.
    pub fn payload_field(&self) -> Option<&'static str> {
        match self {
            PartitionKey::JobId => Some("job_id"),
            PartitionKey::ResourceId => Some("resource_id"),
            PartitionKey::ComponentId => Some("component"),
            PartitionKey::Unkeyed => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub partitions: u32,
    pub replication: u16,
    pub min_insync_replicas: u16,
    pub retention: Duration,
    pub compression: Compression,
    pub partition_key: PartitionKey,
}

impl ChannelSpec {
    pub fn retention_days(&self) -> u64 {
        self.retention.as_secs() / DAY.as_secs()
    }
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::JobLifecycle,
        Channel::JobMetrics,
        Channel::Notifications,
        Channel::AuditTrail,
        Channel::SystemHealth,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::JobLifecycle => "job-lifecycle",
            Channel::JobMetrics => "job-metrics",
            Channel::Notifications => "notifications",
            Channel::AuditTrail => "audit-trail",
            Channel::SystemHealth => "system-health",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn spec(&self) -> ChannelSpec {
        match self {
            Channel::JobLifecycle => ChannelSpec {
                partitions: 10,
                replication: 1,
                min_insync_replicas: 1,
                retention: DAY * 30,
                compression: Compression::Snappy,
                partition_key: PartitionKey::JobId,
            },
            Channel::JobMetrics => ChannelSpec {
                partitions: 20,
                replication: 1,
                min_insync_replicas: 1,
                retention: DAY * 7,
                compression: Compression::Snappy,
                partition_key: PartitionKey::JobId,
            },
            Channel::Notifications => ChannelSpec {
                partitions: 5,
                replication: 1,
                min_insync_replicas: 1,
                retention: DAY * 7,
                compression: Compression::Lz4,
                partition_key: PartitionKey::Unkeyed,
            },
            Channel::AuditTrail => ChannelSpec {
                partitions: 5,
                replication: 1,
                min_insync_replicas: 1,
                retention: DAY * 90,
                compression: Compression::Snappy,
                partition_key: PartitionKey::ResourceId,
            },
            Channel::SystemHealth => ChannelSpec {
                partitions: 3,
                replication: 1,
                min_insync_replicas: 1,
                retention: DAY * 7,
                compression: Compression::Lz4,
                partition_key: PartitionKey::ComponentId,
            },
        }
    }

    /// Partition for a key. Stable across processes (FNV-1a).
    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in key.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash % self.spec().partitions
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Every bound queue gets a copy.
    Fanout,
    /// Delivery by routing key.
    Direct,
}

/// Ephemeral (low-latency, non-replayable) exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    JobEvents,
    Notifications,
    DeadLetter,
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::JobEvents, Exchange::Notifications, Exchange::DeadLetter];

    pub fn name(&self) -> &'static str {
        match self {
            Exchange::JobEvents => "job.events",
            Exchange::Notifications => "notifications",
            Exchange::DeadLetter => "dlx",
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        match self {
            Exchange::JobEvents => ExchangeKind::Fanout,
            Exchange::Notifications | Exchange::DeadLetter => ExchangeKind::Direct,
        }
    }

    /// Queues bound to this exchange.
    pub fn queues(&self) -> impl Iterator<Item = &'static QueueSpec> {
        let exchange = *self;
        QUEUES.iter().filter(move |q| q.exchange == exchange)
    }
}

impl core::fmt::Display for Exchange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: &'static str,
    pub exchange: Exchange,
    pub ttl: Duration,
    pub max_length: usize,
    pub max_retries: u32,
}

pub const MAX_QUEUE_LENGTH: usize = 100_000;

pub const JOB_EVENTS_API_QUEUE: &str = "job-events-api";
pub const JOB_EVENTS_AUDIT_QUEUE: &str = "job-events-audit";
pub const WEBSOCKET_BROADCAST_QUEUE: &str = "websocket-broadcast";
pub const DEAD_LETTER_QUEUE: &str = "job-dlq";

pub static QUEUES: [QueueSpec; 4] = [
    QueueSpec {
        name: JOB_EVENTS_API_QUEUE,
        exchange: Exchange::JobEvents,
        ttl: DAY,
        max_length: MAX_QUEUE_LENGTH,
        max_retries: 3,
    },
    QueueSpec {
        name: JOB_EVENTS_AUDIT_QUEUE,
        exchange: Exchange::JobEvents,
        ttl: Duration::from_secs(30 * 24 * 60 * 60),
        max_length: MAX_QUEUE_LENGTH,
        max_retries: 5,
    },
    QueueSpec {
        name: WEBSOCKET_BROADCAST_QUEUE,
        exchange: Exchange::Notifications,
        ttl: DAY,
        max_length: MAX_QUEUE_LENGTH,
        max_retries: 2,
    },
    QueueSpec {
        name: DEAD_LETTER_QUEUE,
        exchange: Exchange::DeadLetter,
        ttl: Duration::from_secs(7 * 24 * 60 * 60),
        max_length: MAX_QUEUE_LENGTH,
        max_retries: 0,
    },
];

pub fn queue(name: &str) -> Option<&'static QueueSpec> {
    QUEUES.iter().find(|q| q.name == name)
}

/// Consumer group names for the durable channels.
pub mod consumer_groups {
    pub const AUDIT: &str = "audit-consumer-group";
    pub const HEALTH: &str = "health-consumer-group";
    pub const NOTIFICATIONS: &str = "notifications-consumer-group";
    pub const METRICS: &str = "metrics-consumer-group";
}
