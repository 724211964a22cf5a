//! Audit trail consumer: immutable, hash-stamped copies of audit events.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use horizon_core::{EventId, UserId};
use horizon_events::{Channel, EventEnvelope, consumer_groups};

use super::{Consumer, ConsumerError};

/// Audit records are kept for this many days.
pub const RETENTION_DAYS: i64 = 90;

/// A stored audit entry. Never modified after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: EventId,
    pub job_id: Option<String>,
    pub user_id: UserId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub details: JsonValue,
    /// SHA-256 (hex) over the identifying fields.
    pub immutable_hash: String,
}

impl AuditRecord {
    fn from_envelope(envelope: &EventEnvelope) -> Self {
        let job_id = envelope
            .payload_str("job_id")
            .or_else(|| match envelope.payload_str("resource_type") {
                Some("job") => envelope.payload_str("resource_id"),
                _ => None,
            })
            .map(str::to_string);

        let mut record = Self {
            event_id: envelope.event_id(),
            job_id,
            user_id: envelope.user_id().clone(),
            event_type: envelope.event_type().to_string(),
            timestamp: envelope.timestamp(),
            details: envelope.payload().clone(),
            immutable_hash: String::new(),
        };
        record.immutable_hash = record.compute_hash();
        record
    }

    fn compute_hash(&self) -> String {
        let stamped = json!({
            "event_id": self.event_id,
            "job_id": self.job_id,
            "timestamp": self.timestamp,
            "event_type": self.event_type,
        });
        hex::encode(Sha256::digest(stamped.to_string().as_bytes()))
    }

    /// The stored hash still matches the record's identifying fields.
    pub fn verify(&self) -> bool {
        self.compute_hash() == self.immutable_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub total_events: usize,
    pub jobs_covered: usize,
    pub oldest_event: Option<DateTime<Utc>>,
    /// No stored record is older than the retention window.
    pub retention_compliant: bool,
}

#[derive(Debug, Default)]
struct AuditState {
    records: Vec<AuditRecord>,
    seen: HashSet<EventId>,
    last_purge: Option<DateTime<Utc>>,
}

pub struct AuditTrailConsumer {
    state: Mutex<AuditState>,
    retention: Duration,
    purge_interval: Duration,
}

impl Default for AuditTrailConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrailConsumer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AuditState::default()),
            retention: Duration::days(RETENTION_DAYS),
            purge_interval: Duration::hours(24),
        }
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AuditState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.state().records.clone()
    }

    pub fn query_by_job(&self, job_id: &str) -> Vec<AuditRecord> {
        self.state()
            .records
            .iter()
            .filter(|r| r.job_id.as_deref() == Some(job_id))
            .cloned()
            .collect()
    }

    pub fn compliance_report(&self) -> ComplianceReport {
        let state = self.state();
        let cutoff = Utc::now() - self.retention;
        let oldest_event = state.records.iter().map(|r| r.timestamp).min();
        let jobs: BTreeSet<&str> = state.records.iter().filter_map(|r| r.job_id.as_deref()).collect();

        ComplianceReport {
            total_events: state.records.len(),
            jobs_covered: jobs.len(),
            oldest_event,
            retention_compliant: oldest_event.is_none_or(|oldest| oldest >= cutoff),
        }
    }

    /// Purge expired records now and report compliance.
    pub fn verify_retention_policy(&self) -> ComplianceReport {
        let removed = self.purge_expired(Utc::now());
        info!(removed, "audit retention policy enforced");
        self.compliance_report()
    }

    /// Drop records older than the retention window as of `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut state = self.state();
        let (kept, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut state.records)
            .into_iter()
            .partition(|r| r.timestamp >= cutoff);
        state.records = kept;
        for record in &expired {
            state.seen.remove(&record.event_id);
        }
        state.last_purge = Some(now);
        expired.len()
    }

    fn purge_due(&self, now: DateTime<Utc>) -> bool {
        self.state()
            .last_purge
            .is_none_or(|last| now - last >= self.purge_interval)
    }
}

#[async_trait]
impl Consumer for AuditTrailConsumer {
    fn name(&self) -> &'static str {
        "audit-trail"
    }

    fn group(&self) -> &'static str {
        consumer_groups::AUDIT
    }

    fn channel(&self) -> Channel {
        Channel::AuditTrail
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ConsumerError> {
        {
            let mut state = self.state();
            if !state.seen.insert(envelope.event_id()) {
                debug!(event_id = %envelope.event_id(), "duplicate audit event ignored");
                return Ok(());
            }
            state.records.push(AuditRecord::from_envelope(envelope));
        }

        let now = Utc::now();
        if self.purge_due(now) {
            let removed = self.purge_expired(now);
            if removed > 0 {
                info!(removed, "purged expired audit records");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_core::CorrelationId;
    use horizon_events::event_types;

    fn audit_event(resource_type: &str, resource_id: &str) -> EventEnvelope {
        EventEnvelope::new(
            event_types::AUDIT_ACTION_RECORDED,
            CorrelationId::new(),
            UserId::from("admin"),
            json!({
                "audit_id": "a-1",
                "action": "job.cancel",
                "actor_user_id": "admin",
                "resource_id": resource_id,
                "resource_type": resource_type,
                "details": {},
            }),
        )
    }

    #[tokio::test]
    async fn stores_hash_stamped_records() {
        let consumer = AuditTrailConsumer::new();
        consumer.handle(&audit_event("job", "job-1")).await.unwrap();

        let records = consumer.query_by_job("job-1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].immutable_hash.len(), 64);
        assert!(records[0].verify());

        let mut tampered = records[0].clone();
        tampered.event_type = "audit.data.access".into();
        assert!(!tampered.verify());
    }

    #[tokio::test]
    async fn redelivered_events_are_stored_once() {
        let consumer = AuditTrailConsumer::new();
        let event = audit_event("job", "job-1");
        consumer.handle(&event).await.unwrap();
        consumer.handle(&event).await.unwrap();

        assert_eq!(consumer.records().len(), 1);
    }

    #[tokio::test]
    async fn non_job_resources_have_no_job_id() {
        let consumer = AuditTrailConsumer::new();
        consumer.handle(&audit_event("dataset", "ds-9")).await.unwrap();

        assert_eq!(consumer.records()[0].job_id, None);
        assert_eq!(consumer.compliance_report().jobs_covered, 0);
    }

    #[tokio::test]
    async fn expired_records_are_purged() {
        let consumer = AuditTrailConsumer::new().with_purge_interval(Duration::zero());
        let old = audit_event("job", "job-old").with_timestamp(Utc::now() - Duration::days(RETENTION_DAYS + 1));
        consumer.handle(&old).await.unwrap();
        consumer.handle(&audit_event("job", "job-new")).await.unwrap();

        let records = consumer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_id.as_deref(), Some("job-new"));
    }

    #[tokio::test]
    async fn purge_forgets_expired_event_ids() {
        let consumer = AuditTrailConsumer::new().with_purge_interval(Duration::days(365));
        let event = audit_event("job", "job-1");
        consumer.handle(&event).await.unwrap();
        assert_eq!(consumer.state().seen.len(), 1);

        let removed = consumer.purge_expired(Utc::now() + Duration::days(RETENTION_DAYS + 1));
        assert_eq!(removed, 1);
        assert!(consumer.state().seen.is_empty());
        assert!(consumer.records().is_empty());
    }

    #[tokio::test]
    async fn compliance_report_reflects_retention() {
        let consumer = AuditTrailConsumer::new().with_purge_interval(Duration::days(365));
        // First event triggers the initial purge; the old one arrives after it.
        consumer.handle(&audit_event("job", "job-1")).await.unwrap();
        let old = audit_event("job", "job-2").with_timestamp(Utc::now() - Duration::days(RETENTION_DAYS + 5));
        consumer.handle(&old).await.unwrap();

        let report = consumer.compliance_report();
        assert_eq!(report.total_events, 2);
        assert_eq!(report.jobs_covered, 2);
        assert!(!report.retention_compliant);

        let report = consumer.verify_retention_policy();
        assert_eq!(report.total_events, 1);
        assert!(report.retention_compliant);
    }
}
