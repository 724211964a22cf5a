//! Event envelope, typed payloads, schema registry and bus abstractions.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod payloads;
pub mod schema;
pub mod topology;

pub use bus::{
    BusError, BusHealth, Delivery, DurableBus, EphemeralBus, PublishReceipt, Record, Subscription,
};
pub use envelope::EventEnvelope;
pub use event::{event_types, Event, EventCategory};
pub use in_memory_bus::{InMemoryDurableBus, InMemoryEphemeralBus};
pub use schema::{
    EventSchema, EventSchemaRegistry, FieldType, SchemaError, SchemaField, SchemaVersion,
    ValidationError,
};
pub use topology::{consumer_groups, Channel, ChannelSpec, Exchange, PartitionKey};
