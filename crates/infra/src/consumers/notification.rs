//! Job notification consumer: tells users when their jobs finish.
//!
//! Reacts only to `job.completed`, `job.failed` and `job.cancelled`. Each
//! notification fans out to email, live broadcast and the in-app inbox;
//! cancellations skip email.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use horizon_core::{JobId, UserId};
use horizon_events::payloads::{JobCancelled, JobCompleted, JobFailed};
use horizon_events::{Channel, EventEnvelope, consumer_groups, event_types};

use super::{Consumer, ConsumerError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    JobCompleted,
    JobFailed,
    JobCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub notification_id: String,
    pub recipient: UserId,
    pub job_id: JobId,
    pub kind: NotificationKind,
    pub subject: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl JobNotification {
    fn new(recipient: UserId, job_id: JobId, kind: NotificationKind, subject: &str, message: String) -> Self {
        Self {
            notification_id: uuid::Uuid::now_v7().to_string(),
            recipient,
            job_id,
            kind,
            subject: subject.to_string(),
            message,
            created_at: Utc::now(),
        }
    }

    fn wants_email(&self) -> bool {
        self.kind != NotificationKind::JobCancelled
    }
}

/// Delivery targets for notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_email(&self, notification: &JobNotification) -> Result<(), ConsumerError>;

    /// Push to the recipient's live sessions.
    async fn broadcast(&self, notification: &JobNotification) -> Result<(), ConsumerError>;

    /// Keep in the recipient's in-app inbox.
    async fn store(&self, notification: &JobNotification) -> Result<(), ConsumerError>;
}

#[derive(Debug, Default)]
struct SinkState {
    emails: Vec<JobNotification>,
    broadcasts: Vec<JobNotification>,
    inbox: HashMap<UserId, Vec<JobNotification>>,
}

/// Sink that records every delivery, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    state: Mutex<SinkState>,
    email_down: AtomicBool,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make email delivery fail.
    pub fn set_email_down(&self, down: bool) {
        self.email_down.store(down, Ordering::SeqCst);
    }

    pub fn emails(&self) -> Vec<JobNotification> {
        self.state().emails.clone()
    }

    pub fn broadcasts(&self) -> Vec<JobNotification> {
        self.state().broadcasts.clone()
    }

    pub fn inbox(&self, user_id: &UserId) -> Vec<JobNotification> {
        self.state().inbox.get(user_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn send_email(&self, notification: &JobNotification) -> Result<(), ConsumerError> {
        if self.email_down.load(Ordering::SeqCst) {
            return Err(ConsumerError::Delivery("smtp relay unavailable".to_string()));
        }
        self.state().emails.push(notification.clone());
        Ok(())
    }

    async fn broadcast(&self, notification: &JobNotification) -> Result<(), ConsumerError> {
        self.state().broadcasts.push(notification.clone());
        Ok(())
    }

    async fn store(&self, notification: &JobNotification) -> Result<(), ConsumerError> {
        self.state()
            .inbox
            .entry(notification.recipient.clone())
            .or_default()
            .push(notification.clone());
        Ok(())
    }
}

pub struct JobNotificationConsumer<N> {
    sink: N,
}

impl<N: NotificationSink> JobNotificationConsumer<N> {
    pub fn new(sink: N) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &N {
        &self.sink
    }

    fn notification_for(envelope: &EventEnvelope) -> Result<Option<JobNotification>, ConsumerError> {
        let invalid = |e: serde_json::Error| ConsumerError::invalid_payload(envelope.event_type(), e);
        let recipient = envelope.user_id().clone();

        let notification = match envelope.event_type() {
            event_types::JOB_COMPLETED => {
                let event: JobCompleted = envelope.decode_payload().map_err(invalid)?;
                let mut message = format!("Your job {} completed successfully.", event.job_id);
                if let Some(url) = &event.output_url {
                    message.push_str(&format!(" Results: {url}"));
                }
                JobNotification::new(recipient, event.job_id, NotificationKind::JobCompleted, "Job completed", message)
            }
            event_types::JOB_FAILED => {
                let event: JobFailed = envelope.decode_payload().map_err(invalid)?;
                JobNotification::new(
                    recipient,
                    event.job_id,
                    NotificationKind::JobFailed,
                    "Job failed",
                    format!("Your job {} failed: {}", event.job_id, event.error_message),
                )
            }
            event_types::JOB_CANCELLED => {
                let event: JobCancelled = envelope.decode_payload().map_err(invalid)?;
                JobNotification::new(
                    recipient,
                    event.job_id,
                    NotificationKind::JobCancelled,
                    "Job cancelled",
                    format!("Your job {} was cancelled.", event.job_id),
                )
            }
            _ => return Ok(None),
        };
        Ok(Some(notification))
    }
}

#[async_trait]
impl<N> Consumer for JobNotificationConsumer<N>
where
    N: NotificationSink + 'static,
{
    fn name(&self) -> &'static str {
        "job-notifications"
    }

    fn group(&self) -> &'static str {
        consumer_groups::NOTIFICATIONS
    }

    fn channel(&self) -> Channel {
        Channel::JobLifecycle
    }

    /// Every target is attempted; the first failure is returned afterwards.
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ConsumerError> {
        let Some(notification) = Self::notification_for(envelope)? else {
            debug!(event_type = envelope.event_type(), "not a terminal job event");
            return Ok(());
        };

        let mut first_error = None;
        let mut record = |target: &str, result: Result<(), ConsumerError>| {
            if let Err(err) = result {
                warn!(
                    target_channel = target,
                    job_id = %notification.job_id,
                    error = %err,
                    "notification delivery failed"
                );
                first_error.get_or_insert(err);
            }
        };

        if notification.wants_email() {
            record("email", self.sink.send_email(&notification).await);
        }
        record("broadcast", self.sink.broadcast(&notification).await);
        record("in_app", self.sink.store(&notification).await);

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(job_id = %notification.job_id, kind = ?notification.kind, "user notified");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_core::CorrelationId;
    use serde_json::json;

    fn terminal(event_type: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope::new(event_type, CorrelationId::new(), UserId::from("u1"), payload)
    }

    #[tokio::test]
    async fn completed_job_reaches_every_target() {
        let consumer = JobNotificationConsumer::new(InMemoryNotificationSink::new());
        let job_id = JobId::new();
        consumer
            .handle(&terminal(
                event_types::JOB_COMPLETED,
                json!({ "job_id": job_id, "output_url": "s3://out/1" }),
            ))
            .await
            .unwrap();

        let sink = consumer.sink();
        assert_eq!(sink.emails().len(), 1);
        assert_eq!(sink.broadcasts().len(), 1);
        let inbox = sink.inbox(&UserId::from("u1"));
        assert_eq!(inbox[0].kind, NotificationKind::JobCompleted);
        assert!(inbox[0].message.contains("s3://out/1"));
    }

    #[tokio::test]
    async fn cancellation_skips_email() {
        let consumer = JobNotificationConsumer::new(InMemoryNotificationSink::new());
        consumer
            .handle(&terminal(
                event_types::JOB_CANCELLED,
                json!({ "job_id": JobId::new(), "cancelled_by": "user", "reason": "n/a" }),
            ))
            .await
            .unwrap();

        assert!(consumer.sink().emails().is_empty());
        assert_eq!(consumer.sink().broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn non_terminal_events_are_ignored() {
        let consumer = JobNotificationConsumer::new(InMemoryNotificationSink::new());
        consumer
            .handle(&terminal(event_types::JOB_SUBMITTED, json!({ "job_id": JobId::new() })))
            .await
            .unwrap();

        assert!(consumer.sink().broadcasts().is_empty());
    }

    #[tokio::test]
    async fn failing_target_does_not_block_the_others() {
        let consumer = JobNotificationConsumer::new(InMemoryNotificationSink::new());
        consumer.sink().set_email_down(true);

        let err = consumer
            .handle(&terminal(
                event_types::JOB_FAILED,
                json!({
                    "job_id": JobId::new(),
                    "error_code": "SCHEDULER_FAILURE",
                    "error_message": "node lost",
                    "retry_count": 0,
                    "max_retries": 0,
                }),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumerError::Delivery(_)));
        assert_eq!(consumer.sink().broadcasts().len(), 1);
        assert!(consumer.sink().inbox(&UserId::from("u1"))[0].message.ends_with("node lost"));
    }
}
