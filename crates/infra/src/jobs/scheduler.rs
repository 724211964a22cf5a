//! HPC scheduler client seam.
//!
//! The scheduler wire protocol is opaque here: submit returns a remote id,
//! status reports progress as a fraction, cancel reports acceptance.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{JobStatus, JobSubmission};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler rejected submission: {0}")]
    Rejected(String),
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
    #[error("unknown scheduler job: {0}")]
    UnknownJob(String),
}

impl SchedulerError {
    /// Stable code carried in `job.failed` events.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Rejected(_) => "SCHEDULER_REJECTED",
            SchedulerError::Unavailable(_) => "SCHEDULER_UNAVAILABLE",
            SchedulerError::UnknownJob(_) => "SCHEDULER_UNKNOWN_JOB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubmission {
    pub remote_job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub status: JobStatus,
    /// Fraction complete, 0.0-1.0
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RemoteStatus {
    /// Progress as an integer percent, clamped to 0-100.
    pub fn progress_percent(&self) -> u8 {
        if !self.progress.is_finite() {
            return 0;
        }
        (self.progress.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn submit(&self, submission: &JobSubmission) -> Result<RemoteSubmission, SchedulerError>;

    async fn status(&self, remote_job_id: &str) -> Result<RemoteStatus, SchedulerError>;

    async fn cancel(&self, remote_job_id: &str) -> Result<bool, SchedulerError>;
}

#[async_trait]
impl<S> SchedulerClient for std::sync::Arc<S>
where
    S: SchedulerClient + ?Sized,
{
    async fn submit(&self, submission: &JobSubmission) -> Result<RemoteSubmission, SchedulerError> {
        (**self).submit(submission).await
    }

    async fn status(&self, remote_job_id: &str) -> Result<RemoteStatus, SchedulerError> {
        (**self).status(remote_job_id).await
    }

    async fn cancel(&self, remote_job_id: &str) -> Result<bool, SchedulerError> {
        (**self).cancel(remote_job_id).await
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    next_id: u64,
    submitted: Vec<String>,
    statuses: HashMap<String, RemoteStatus>,
    cancelled: Vec<String>,
    /// Datasets whose submissions are rejected
    rejected_datasets: Vec<String>,
    offline: bool,
    /// Simulated round trip for submissions
    latency: Duration,
    in_flight: usize,
    max_in_flight: usize,
    /// Times the in-flight count fell back to zero
    drains: usize,
}

/// Scriptable in-process scheduler for tests/dev.
///
/// Remote ids are `hpc-<n>`. Newly submitted jobs report `QUEUING` at 0.0
/// until a status is scripted with [`InMemoryScheduler::set_status`].
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    state: Mutex<SchedulerState>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject every submission for this dataset.
    pub fn reject_dataset(&self, dataset_id: impl Into<String>) {
        self.state().rejected_datasets.push(dataset_id.into());
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Make each submission take `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Highest number of submissions observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    /// Number of times all in-flight submissions had completed.
    pub fn drains(&self) -> usize {
        self.state().drains
    }

    pub fn set_status(&self, remote_job_id: &str, status: RemoteStatus) {
        self.state().statuses.insert(remote_job_id.to_string(), status);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }
}

#[async_trait]
impl SchedulerClient for InMemoryScheduler {
    async fn submit(&self, submission: &JobSubmission) -> Result<RemoteSubmission, SchedulerError> {
        let latency = {
            let mut state = self.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            state.drains += 1;
        }
        if state.offline {
            return Err(SchedulerError::Unavailable("scheduler offline".to_string()));
        }
        if state.rejected_datasets.contains(&submission.dataset_id) {
            return Err(SchedulerError::Rejected(format!(
                "dataset {} is not staged",
                submission.dataset_id
            )));
        }

        state.next_id += 1;
        let remote_job_id = format!("hpc-{}", state.next_id);
        state.submitted.push(remote_job_id.clone());
        state.statuses.insert(
            remote_job_id.clone(),
            RemoteStatus {
                status: JobStatus::Queuing,
                progress: 0.0,
                output_url: None,
                error_message: None,
            },
        );
        Ok(RemoteSubmission { remote_job_id })
    }

    async fn status(&self, remote_job_id: &str) -> Result<RemoteStatus, SchedulerError> {
        let state = self.state();
        if state.offline {
            return Err(SchedulerError::Unavailable("scheduler offline".to_string()));
        }
        state
            .statuses
            .get(remote_job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(remote_job_id.to_string()))
    }

    async fn cancel(&self, remote_job_id: &str) -> Result<bool, SchedulerError> {
        let mut state = self.state();
        if state.offline {
            return Err(SchedulerError::Unavailable("scheduler offline".to_string()));
        }
        if !state.statuses.contains_key(remote_job_id) {
            return Ok(false);
        }
        state.cancelled.push(remote_job_id.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fraction_converts_to_percent() {
        let mut status = RemoteStatus {
            status: JobStatus::Running,
            progress: 0.45,
            output_url: None,
            error_message: None,
        };
        assert_eq!(status.progress_percent(), 45);
        status.progress = 1.7;
        assert_eq!(status.progress_percent(), 100);
        status.progress = f64::NAN;
        assert_eq!(status.progress_percent(), 0);
    }

    #[tokio::test]
    async fn scripted_rejection_and_status() {
        let scheduler = InMemoryScheduler::new();
        scheduler.reject_dataset("bad");

        let err = scheduler
            .submit(&JobSubmission::new("AlphaCal", "bad"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCHEDULER_REJECTED");

        let ok = scheduler
            .submit(&JobSubmission::new("AlphaCal", "good"))
            .await
            .unwrap();
        assert_eq!(ok.remote_job_id, "hpc-1");
        assert_eq!(
            scheduler.status("hpc-1").await.unwrap().status,
            JobStatus::Queuing
        );
        assert!(scheduler.cancel("hpc-1").await.unwrap());
        assert!(!scheduler.cancel("hpc-404").await.unwrap());
    }
}
