//! Metrics consumer: per-job resource samples and running summaries.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use horizon_core::JobId;
use horizon_events::payloads::JobMetricsRecorded;
use horizon_events::{Channel, EventEnvelope, consumer_groups, event_types};

use super::{Consumer, ConsumerError};

/// Samples older than this are dropped by [`MetricsAggregator::clear_old`].
pub const DEFAULT_MAX_AGE_MINUTES: i64 = 1440;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: f64,
    pub execution_time_seconds: f64,
    pub gpu_utilization_percent: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub job_id: JobId,
    pub sample_count: usize,
    pub avg_cpu_usage_percent: f64,
    pub max_cpu_usage_percent: f64,
    pub avg_memory_usage_mb: f64,
    pub max_memory_usage_mb: f64,
    pub latest_execution_time_seconds: f64,
}

impl MetricsSummary {
    fn from_samples(job_id: JobId, samples: &[MetricSample]) -> Option<Self> {
        let last = samples.last()?;
        let n = samples.len() as f64;
        let (cpu_sum, cpu_max, mem_sum, mem_max) = samples.iter().fold(
            (0.0, f64::MIN, 0.0, f64::MIN),
            |(cs, cm, ms, mm), s| {
                (
                    cs + s.cpu_usage_percent,
                    cm.max(s.cpu_usage_percent),
                    ms + s.memory_usage_mb,
                    mm.max(s.memory_usage_mb),
                )
            },
        );

        Some(Self {
            job_id,
            sample_count: samples.len(),
            avg_cpu_usage_percent: cpu_sum / n,
            max_cpu_usage_percent: cpu_max,
            avg_memory_usage_mb: mem_sum / n,
            max_memory_usage_mb: mem_max,
            latest_execution_time_seconds: last.execution_time_seconds,
        })
    }
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    samples: RwLock<HashMap<JobId, Vec<MetricSample>>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job_id: JobId, sample: MetricSample) {
        let mut samples = self.samples.write().unwrap_or_else(PoisonError::into_inner);
        samples.entry(job_id).or_default().push(sample);
    }

    pub fn samples(&self, job_id: JobId) -> Vec<MetricSample> {
        let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
        samples.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn summary(&self, job_id: JobId) -> Option<MetricsSummary> {
        let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
        samples
            .get(&job_id)
            .and_then(|s| MetricsSummary::from_samples(job_id, s))
    }

    pub fn tracked_jobs(&self) -> Vec<JobId> {
        let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
        let mut jobs: Vec<JobId> = samples.keys().copied().collect();
        jobs.sort();
        jobs
    }

    /// Drop samples older than `max_age`; jobs left without samples are
    /// forgotten. Returns the number of samples removed.
    pub fn clear_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut samples = self.samples.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        samples.retain(|_, job_samples| {
            let before = job_samples.len();
            job_samples.retain(|s| s.recorded_at >= cutoff);
            removed += before - job_samples.len();
            !job_samples.is_empty()
        });
        removed
    }

    pub fn clear_old(&self) -> usize {
        self.clear_older_than(Duration::minutes(DEFAULT_MAX_AGE_MINUTES))
    }
}

#[async_trait]
impl Consumer for MetricsAggregator {
    fn name(&self) -> &'static str {
        "metrics-aggregator"
    }

    fn group(&self) -> &'static str {
        consumer_groups::METRICS
    }

    fn channel(&self) -> Channel {
        Channel::JobMetrics
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ConsumerError> {
        if envelope.event_type() != event_types::JOB_METRICS_RECORDED {
            debug!(event_type = envelope.event_type(), "ignoring non sample metrics event");
            return Ok(());
        }

        let event: JobMetricsRecorded = envelope
            .decode_payload()
            .map_err(|e| ConsumerError::invalid_payload(envelope.event_type(), e))?;

        self.record(
            event.job_id,
            MetricSample {
                cpu_usage_percent: event.cpu_usage_percent,
                memory_usage_mb: event.memory_usage_mb,
                execution_time_seconds: event.execution_time_seconds,
                gpu_utilization_percent: event.gpu_utilization_percent,
                recorded_at: envelope.timestamp(),
            },
        );
        Ok(())
    }
}
