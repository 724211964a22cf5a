//! Periodic worker housekeeping: consumer health reports onto the
//! system-health channel and age-based clearing of metric samples.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use horizon_core::{CorrelationId, UserId};
use horizon_events::payloads::HealthCheckReported;
use horizon_infra::EventPublisher;
use horizon_infra::consumers::{ConsumerHandle, ConsumerStats, MetricsAggregator};

pub const REPORT_INTERVAL: Duration = Duration::from_secs(30);

const REPORTER_USER: &str = "system";

/// Failed handler calls plus malformed records, as a percentage of all records seen.
pub fn error_rate(stats: &ConsumerStats) -> f64 {
    let total = stats.processed + stats.failed + stats.malformed;
    if total == 0 {
        return 0.0;
    }
    (stats.failed + stats.malformed) as f64 * 100.0 / total as f64
}

pub fn report_for(name: &str, stats: &ConsumerStats) -> HealthCheckReported {
    HealthCheckReported {
        component: name.to_string(),
        job_id: None,
        error_rate: error_rate(stats),
        consumer_lag_ms: 0,
        available_memory_mb: None,
        cpu_usage_percent: None,
    }
}

pub struct HealthReporter {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<Vec<ConsumerHandle>>>,
}

impl HealthReporter {
    /// Takes ownership of the handles; they are handed back by [`HealthReporter::stop`].
    ///
    /// When `metrics` is given, samples past their maximum age are cleared on every tick.
    pub fn spawn(
        publisher: Arc<EventPublisher>,
        handles: Vec<ConsumerHandle>,
        metrics: Option<Arc<MetricsAggregator>>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Some(metrics) = &metrics {
                            let removed = metrics.clear_old();
                            if removed > 0 {
                                debug!(removed, "cleared old metric samples");
                            }
                        }
                        for handle in &handles {
                            let report = report_for(handle.name(), &handle.stats());
                            let outcome = publisher
                                .publish_event(CorrelationId::new(), UserId::from(REPORTER_USER), report)
                                .await;
                            if outcome.is_success() {
                                debug!(consumer = handle.name(), "health report published");
                            } else {
                                warn!(consumer = handle.name(), "health report not delivered");
                            }
                        }
                    }
                }
            }
            handles
        });

        Self {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    pub async fn stop(mut self) -> Vec<ConsumerHandle> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.take() {
            Some(join) => join.await.unwrap_or_else(|err| {
                warn!(error = %err, "health reporter task failed");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }
}
