//! System health consumer: tracks error rate and consumer lag per job.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use horizon_core::JobId;
use horizon_events::payloads::HealthCheckReported;
use horizon_events::{Channel, EventEnvelope, consumer_groups, event_types};

use super::{Consumer, ConsumerError};

/// Error rate (percent) above which an alert is raised.
pub const ERROR_RATE_THRESHOLD: f64 = 5.0;
pub const CONSUMER_LAG_THRESHOLD_MS: u64 = 10_000;
/// Oldest alerts are dropped beyond this.
pub const MAX_ALERTS: usize = 100;

/// Latest health sample for a job (or a component when no job is named).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetric {
    pub component: String,
    pub job_id: Option<JobId>,
    pub error_rate: f64,
    pub consumer_lag_ms: u64,
    pub available_memory_mb: Option<f64>,
    pub cpu_usage_percent: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl HealthMetric {
    fn subject(&self) -> String {
        match self.job_id {
            Some(job_id) => format!("job {job_id}"),
            None => format!("component {}", self.component),
        }
    }

    fn error_rate_exceeded(&self) -> bool {
        self.error_rate > ERROR_RATE_THRESHOLD
    }

    fn consumer_lag_exceeded(&self) -> bool {
        self.consumer_lag_ms > CONSUMER_LAG_THRESHOLD_MS
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    ConsumerLag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub kind: AlertKind,
    pub component: String,
    pub job_id: Option<JobId>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub overall_healthy: bool,
    pub error_rate_threshold_exceeded: bool,
    pub consumer_lag_threshold_exceeded: bool,
    pub alerts: Vec<HealthAlert>,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct HealthState {
    metrics: HashMap<String, HealthMetric>,
    alerts: VecDeque<HealthAlert>,
    last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct SystemHealthConsumer {
    state: Mutex<HealthState>,
}

impl SystemHealthConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a sample and raise alerts for breached thresholds.
    pub fn record(&self, metric: HealthMetric) {
        let mut alerts = Vec::new();
        if metric.error_rate_exceeded() {
            alerts.push(HealthAlert {
                kind: AlertKind::ErrorRate,
                component: metric.component.clone(),
                job_id: metric.job_id,
                message: format!("High error rate detected for {}: {}%", metric.subject(), metric.error_rate),
                raised_at: metric.recorded_at,
            });
        }
        if metric.consumer_lag_exceeded() {
            alerts.push(HealthAlert {
                kind: AlertKind::ConsumerLag,
                component: metric.component.clone(),
                job_id: metric.job_id,
                message: format!(
                    "High consumer lag detected for {}: {}ms",
                    metric.subject(),
                    metric.consumer_lag_ms
                ),
                raised_at: metric.recorded_at,
            });
        }

        let mut state = self.state();
        for alert in alerts {
            warn!(component = %alert.component, kind = ?alert.kind, "{}", alert.message);
            state.alerts.push_back(alert);
            if state.alerts.len() > MAX_ALERTS {
                state.alerts.pop_front();
            }
        }

        let key = metric
            .job_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| metric.component.clone());
        state.last_check = Some(metric.recorded_at);
        state.metrics.insert(key, metric);
    }

    pub fn health_status(&self) -> HealthStatus {
        let state = self.state();
        let error_rate_threshold_exceeded = state.metrics.values().any(HealthMetric::error_rate_exceeded);
        let consumer_lag_threshold_exceeded = state.metrics.values().any(HealthMetric::consumer_lag_exceeded);

        HealthStatus {
            overall_healthy: !error_rate_threshold_exceeded && !consumer_lag_threshold_exceeded,
            error_rate_threshold_exceeded,
            consumer_lag_threshold_exceeded,
            alerts: state.alerts.iter().cloned().collect(),
            last_check: state.last_check,
        }
    }

    pub fn metric_for_job(&self, job_id: JobId) -> Option<HealthMetric> {
        self.state().metrics.get(&job_id.to_string()).cloned()
    }

    pub fn metrics(&self) -> Vec<HealthMetric> {
        self.state().metrics.values().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<HealthAlert> {
        self.state().alerts.iter().cloned().collect()
    }

    pub fn clear(&self) {
        *self.state() = HealthState::default();
    }
}

#[async_trait]
impl Consumer for SystemHealthConsumer {
    fn name(&self) -> &'static str {
        "system-health"
    }

    fn group(&self) -> &'static str {
        consumer_groups::HEALTH
    }

    fn channel(&self) -> Channel {
        Channel::SystemHealth
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ConsumerError> {
        if envelope.event_type() != event_types::SYSTEM_HEALTH_CHECK {
            debug!(event_type = envelope.event_type(), "ignoring non health-check event");
            return Ok(());
        }

        let report: HealthCheckReported = envelope
            .decode_payload()
            .map_err(|e| ConsumerError::invalid_payload(envelope.event_type(), e))?;

        self.record(HealthMetric {
            component: report.component,
            job_id: report.job_id,
            error_rate: report.error_rate,
            consumer_lag_ms: report.consumer_lag_ms,
            available_memory_mb: report.available_memory_mb,
            cpu_usage_percent: report.cpu_usage_percent,
            recorded_at: envelope.timestamp(),
        });
        Ok(())
    }
}
