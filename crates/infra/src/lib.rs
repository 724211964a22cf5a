//! Infrastructure layer: job orchestration, dual-bus publishing, Redis
//! transports, consumers and configuration.

pub mod config;
pub mod consumers;
pub mod event_bus;
pub mod jobs;
pub mod publisher;


pub use config::{ConfigError, HorizonConfig};
pub use publisher::{DeliveryStatus, EventPublisher, PublishOutcome, PublisherHealth, PublisherStats, SupervisorHandle};
