//! Consumer worker: connects both buses and runs the four durable consumers
//! until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use horizon_events::EventSchemaRegistry;
use horizon_infra::consumers::{
    AuditTrailConsumer, ConsumerHandle, ConsumerRunner, InMemoryNotificationSink, JobNotificationConsumer,
    MetricsAggregator, SystemHealthConsumer,
};
use horizon_infra::event_bus::{RedisPubSubBus, RedisStreamsBus, RedisStreamsConfig};
use horizon_infra::publisher::DEFAULT_SUPERVISE_INTERVAL;
use horizon_infra::{EventPublisher, HorizonConfig};

mod reporter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    horizon_observability::init();

    let config = HorizonConfig::from_env().context("invalid configuration")?;

    let durable = Arc::new(RedisStreamsBus::new(
        RedisStreamsConfig::new(&config.redis_url).with_key_prefix(&config.key_prefix),
    )?);
    let ephemeral = Arc::new(RedisPubSubBus::new(&config.redis_url, &config.key_prefix)?);

    let mut publisher = EventPublisher::new(ephemeral, durable.clone())
        .with_reconnect_policy(config.reconnect.clone())
        .with_publish_timeout(config.publish_timeout);
    if config.validate_events {
        publisher = publisher.with_registry(Arc::new(EventSchemaRegistry::with_builtin_schemas()?));
    }
    let publisher = Arc::new(publisher);

    let health = publisher.start().await;
    if !health.is_healthy() {
        warn!(ephemeral = ?health.ephemeral, durable = ?health.durable, "starting with degraded buses");
    }
    if !health.durable.is_connected() {
        anyhow::bail!("durable bus unavailable; consumers cannot join their groups");
    }
    let supervisor = publisher.supervise(DEFAULT_SUPERVISE_INTERVAL);

    let member = config.consumer_name.as_str();
    let metrics = Arc::new(MetricsAggregator::new());
    let handles: Vec<ConsumerHandle> = vec![
        ConsumerRunner::spawn(Arc::new(AuditTrailConsumer::new()), durable.clone(), member).await?,
        ConsumerRunner::spawn(Arc::new(SystemHealthConsumer::new()), durable.clone(), member).await?,
        ConsumerRunner::spawn(
            Arc::new(JobNotificationConsumer::new(InMemoryNotificationSink::new())),
            durable.clone(),
            member,
        )
        .await?,
        ConsumerRunner::spawn(metrics.clone(), durable.clone(), member).await?,
    ];
    info!(member, consumers = handles.len(), "worker running");

    let reporter = reporter::HealthReporter::spawn(
        publisher.clone(),
        handles,
        Some(metrics),
        reporter::REPORT_INTERVAL,
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    for handle in reporter.stop().await {
        let name = handle.name();
        let stats = handle.stats();
        handle.shutdown().await;
        info!(
            consumer = name,
            processed = stats.processed,
            failed = stats.failed,
            malformed = stats.malformed,
            "consumer stopped"
        );
    }
    supervisor.stop().await;
    publisher.shutdown().await;
    Ok(())
}
