//! Schemas for the events the platform itself publishes.

use super::{EventSchema, FieldType, SchemaField};
use crate::event::event_types;

const JOB_STATUSES: [&str; 6] = ["QUEUED", "QUEUING", "RUNNING", "COMPLETED", "FAILED", "CANCELLED"];

fn job_id() -> SchemaField {
    SchemaField::required("job_id", FieldType::String)
}

pub fn builtin_schemas() -> Vec<(&'static str, EventSchema)> {
    vec![
        (
            event_types::JOB_SUBMITTED,
            EventSchema::new("JobSubmitted", "1.0.0")
                .describe("A job was accepted for submission")
                .field(job_id())
                .field(SchemaField::required("agent", FieldType::String))
                .field(SchemaField::required("dataset_id", FieldType::String))
                .field(SchemaField::optional("params", FieldType::Object)),
        ),
        (
            event_types::JOB_SUBMITTED,
            EventSchema::new("JobSubmitted", "1.1.0")
                .describe("Adds the requested GPU count")
                .field(job_id())
                .field(SchemaField::required("agent", FieldType::String))
                .field(SchemaField::required("dataset_id", FieldType::String))
                .field(SchemaField::optional("params", FieldType::Object))
                .field(SchemaField::optional("gpu_count", FieldType::Number)),
        ),
        (
            event_types::JOB_STATUS_CHANGED,
            EventSchema::new("JobStatusChanged", "1.0.0")
                .field(job_id())
                .field(SchemaField::required("previous_status", FieldType::String).one_of(JOB_STATUSES))
                .field(SchemaField::required("new_status", FieldType::String).one_of(JOB_STATUSES))
                .field(SchemaField::optional("reason", FieldType::String)),
        ),
        (
            event_types::JOB_COMPLETED,
            EventSchema::new("JobCompleted", "1.0.0")
                .field(job_id())
                .field(SchemaField::optional("output_url", FieldType::String))
                .field(SchemaField::optional("execution_time_ms", FieldType::Number)),
        ),
        (
            event_types::JOB_FAILED,
            EventSchema::new("JobFailed", "1.0.0")
                .field(job_id())
                .field(SchemaField::required("error_code", FieldType::String))
                .field(SchemaField::required("error_message", FieldType::String))
                .field(SchemaField::required("retry_count", FieldType::Number))
                .field(SchemaField::required("max_retries", FieldType::Number)),
        ),
        (
            event_types::JOB_CANCELLED,
            EventSchema::new("JobCancelled", "1.0.0")
                .field(job_id())
                .field(SchemaField::required("cancelled_by", FieldType::String))
                .field(SchemaField::required("reason", FieldType::String)),
        ),
        (
            event_types::JOB_METRICS_RECORDED,
            EventSchema::new("JobMetricsRecorded", "1.0.0")
                .field(job_id())
                .field(SchemaField::required("cpu_usage_percent", FieldType::Number))
                .field(SchemaField::required("memory_usage_mb", FieldType::Number))
                .field(SchemaField::required("execution_time_seconds", FieldType::Number))
                .field(SchemaField::optional("gpu_utilization_percent", FieldType::Number)),
        ),
        (
            event_types::AUDIT_ACTION_RECORDED,
            EventSchema::new("AuditActionRecorded", "1.0.0")
                .field(SchemaField::required("audit_id", FieldType::String))
                .field(SchemaField::required("action", FieldType::String))
                .field(SchemaField::required("actor_user_id", FieldType::String))
                .field(SchemaField::required("resource_id", FieldType::String))
                .field(
                    SchemaField::required("resource_type", FieldType::String)
                        .one_of(["job", "user", "system", "dataset"]),
                )
                .field(SchemaField::optional("details", FieldType::Object)),
        ),
        (
            event_types::SYSTEM_HEALTH_CHECK,
            EventSchema::new("HealthCheckReported", "1.0.0")
                .field(SchemaField::required("component", FieldType::String))
                .field(SchemaField::optional("job_id", FieldType::String))
                .field(SchemaField::required("error_rate", FieldType::Number))
                .field(SchemaField::required("consumer_lag_ms", FieldType::Number))
                .field(SchemaField::optional("available_memory_mb", FieldType::Number))
                .field(SchemaField::optional("cpu_usage_percent", FieldType::Number)),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EventSchemaRegistry;

    #[test]
    fn builtin_catalog_registers_cleanly() {
        let registry = EventSchemaRegistry::with_builtin_schemas().unwrap();
        assert_eq!(registry.schema_versions(event_types::JOB_SUBMITTED), vec!["1.0.0", "1.1.0"]);
        assert!(registry.is_compatible(event_types::JOB_SUBMITTED, "1.0.0", "1.1.0"));
        assert!(!registry.is_compatible(event_types::JOB_SUBMITTED, "1.1.0", "1.0.0"));
    }
}
