//! Typed payloads for the events the platform publishes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use horizon_core::{JobId, UserId};

use crate::event::{event_types, Event};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmitted {
    pub job_id: JobId,
    pub agent: String,
    pub dataset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    #[serde(default)]
    pub params: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusChanged {
    pub job_id: JobId,
    pub previous_status: String,
    pub new_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: JobId,
    pub error_code: String,
    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCancelled {
    pub job_id: JobId,
    pub cancelled_by: String,
    pub reason: String,
}

/// One resource-usage sample of a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetricsRecorded {
    pub job_id: JobId,
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: f64,
    pub execution_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_utilization_percent: Option<f64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationChannel {
    Email,
    Websocket,
    Push,
    InApp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSent {
    pub notification_id: String,
    pub recipient_user_id: UserId,
    pub channel: NotificationChannel,
    pub subject: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_job_id: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditActionRecorded {
    pub audit_id: String,
    pub action: String,
    pub actor_user_id: UserId,
    pub resource_id: String,
    pub resource_type: String,
    #[serde(default)]
    pub details: JsonValue,
}

/// Health sample reported by a component (a job runner, a consumer, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckReported {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Percentage, 0-100.
    pub error_rate: f64,
    pub consumer_lag_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_memory_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<f64>,
}

macro_rules! impl_event {
    ($t:ty, $name:expr) => {
        impl Event for $t {
            fn event_type(&self) -> &'static str {
                $name
            }
        }
    };
}

impl_event!(JobSubmitted, event_types::JOB_SUBMITTED);
impl_event!(JobStatusChanged, event_types::JOB_STATUS_CHANGED);
impl_event!(JobCompleted, event_types::JOB_COMPLETED);
impl_event!(JobFailed, event_types::JOB_FAILED);
impl_event!(JobCancelled, event_types::JOB_CANCELLED);
impl_event!(JobMetricsRecorded, event_types::JOB_METRICS_RECORDED);
impl_event!(NotificationSent, event_types::NOTIFICATION_SENT);
impl_event!(AuditActionRecorded, event_types::AUDIT_ACTION_RECORDED);
impl_event!(HealthCheckReported, event_types::SYSTEM_HEALTH_CHECK);
