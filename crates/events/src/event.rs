use serde::{Deserialize, Serialize};

/// Stable event type names.
pub mod event_types {
    pub const JOB_SUBMITTED: &str = "job.submitted";
    pub const JOB_STATUS_CHANGED: &str = "job.status.changed";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const JOB_CANCELLED: &str = "job.cancelled";

    pub const NOTIFICATION_SENT: &str = "notification.sent";
    pub const NOTIFICATION_READ: &str = "notification.read";
    pub const NOTIFICATION_DISMISSED: &str = "notification.dismissed";
    pub const ALERT_RAISED: &str = "alert.raised";
    pub const ALERT_RESOLVED: &str = "alert.resolved";

    pub const JOB_METRICS_RECORDED: &str = "job.metrics.recorded";
    pub const JOB_PERFORMANCE_SUMMARY: &str = "job.performance.summary";

    pub const SYSTEM_HEALTH_CHECK: &str = "system.health.check";
    pub const RESOURCE_ALLOCATION_CHANGED: &str = "resource.allocation.changed";

    pub const AUDIT_ACTION_RECORDED: &str = "audit.action.recorded";
    pub const AUDIT_POLICY_CHANGED: &str = "audit.policy.changed";
    pub const AUDIT_DATA_ACCESS: &str = "audit.data.access";
    pub const AUDIT_JOB_LIFECYCLE: &str = "audit.job.lifecycle";
    pub const AUDIT_COMPLIANCE_CHECK: &str = "audit.compliance.check";

    pub const JOB_LIFECYCLE: [&str; 5] = [
        JOB_SUBMITTED,
        JOB_STATUS_CHANGED,
        JOB_COMPLETED,
        JOB_FAILED,
        JOB_CANCELLED,
    ];
}

/// Routing category of an event type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    JobLifecycle,
    Notification,
    Metrics,
    Audit,
    Health,
}

impl EventCategory {
    /// Categorize a dotted event type. Unknown prefixes yield `None`.
    pub fn of(event_type: &str) -> Option<Self> {
        if event_type.starts_with("job.metrics.") || event_type.starts_with("job.performance.") {
            Some(Self::Metrics)
        } else if event_type.starts_with("job.") {
            Some(Self::JobLifecycle)
        } else if event_type.starts_with("notification.") || event_type.starts_with("alert.") {
            Some(Self::Notification)
        } else if event_type.starts_with("audit.") {
            Some(Self::Audit)
        } else if event_type.starts_with("system.health.") || event_type.starts_with("resource.") {
            Some(Self::Health)
        } else {
            None
        }
    }
}

/// A typed event payload.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution through the registry)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "job.submitted").
    fn event_type(&self) -> &'static str;

    /// Schema version of the envelope carrying this event.
    fn schema_version(&self) -> u32 {
        1
    }

    fn category(&self) -> EventCategory {
        EventCategory::of(self.event_type()).unwrap_or(EventCategory::JobLifecycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_prefixes_win_over_job_prefix() {
        assert_eq!(
            EventCategory::of(event_types::JOB_METRICS_RECORDED),
            Some(EventCategory::Metrics)
        );
        assert_eq!(
            EventCategory::of(event_types::JOB_PERFORMANCE_SUMMARY),
            Some(EventCategory::Metrics)
        );
        for job_event in event_types::JOB_LIFECYCLE {
            assert_eq!(EventCategory::of(job_event), Some(EventCategory::JobLifecycle));
        }
    }

    #[test]
    fn remaining_categories() {
        assert_eq!(EventCategory::of("alert.raised"), Some(EventCategory::Notification));
        assert_eq!(EventCategory::of("audit.data.access"), Some(EventCategory::Audit));
        assert_eq!(EventCategory::of("system.health.check"), Some(EventCategory::Health));
        assert_eq!(EventCategory::of("billing.invoice"), None);
    }
}
