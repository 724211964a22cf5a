//! Core job types.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use horizon_core::{CorrelationId, DomainError, DomainResult, UserId};

pub use horizon_core::JobId;

/// Free-form job parameters (`gpu_count`, `rfi_strategy`, `max_runtime`, ...).
pub type JobParams = Map<String, JsonValue>;

/// Job lifecycle status.
///
/// `QUEUED → QUEUING → RUNNING → {COMPLETED, FAILED, CANCELLED}`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Recorded locally, not yet handed to the scheduler
    Queued,
    /// Accepted by the scheduler
    Queuing,
    /// Executing on the cluster
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Statuses that carry a completion timestamp. Cancellation does not.
    pub fn marks_completion(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses whose upstream state is worth polling.
    pub fn is_active_upstream(&self) -> bool {
        matches!(self, JobStatus::Queuing | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Queuing => "QUEUING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "QUEUING" => Ok(JobStatus::Queuing),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Processing agent a job runs. Unknown agent names are carried through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Agent {
    AlphaCal,
    ImageReconstruction,
    AnomalyDetection,
    Other(String),
}

impl Agent {
    pub fn as_str(&self) -> &str {
        match self {
            Agent::AlphaCal => "AlphaCal",
            Agent::ImageReconstruction => "ImageReconstruction",
            Agent::AnomalyDetection => "AnomalyDetection",
            Agent::Other(name) => name,
        }
    }
}

impl From<String> for Agent {
    fn from(value: String) -> Self {
        match value.as_str() {
            "AlphaCal" => Agent::AlphaCal,
            "ImageReconstruction" => Agent::ImageReconstruction,
            "AnomalyDetection" => Agent::AnomalyDetection,
            _ => Agent::Other(value),
        }
    }
}

impl From<&str> for Agent {
    fn from(value: &str) -> Self {
        Agent::from(value.to_string())
    }
}

impl From<Agent> for String {
    fn from(value: Agent) -> Self {
        match value {
            Agent::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl core::fmt::Display for Agent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome data attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metrics: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobResult {
    pub fn output(url: impl Into<String>) -> Self {
        Self {
            output_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// A request to run an agent against a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub agent: Agent,
    pub dataset_id: String,
    #[serde(default)]
    pub params: JobParams,
}

impl JobSubmission {
    pub fn new(agent: impl Into<Agent>, dataset_id: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            dataset_id: dataset_id.into(),
            params: JobParams::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Requested GPU count. Absent, non-numeric or negative values read as `None`.
    pub fn gpu_count(&self) -> Option<u32> {
        self.params
            .get("gpu_count")
            .and_then(JsonValue::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    pub fn rfi_strategy(&self) -> Option<&str> {
        self.params.get("rfi_strategy").and_then(JsonValue::as_str)
    }

    pub fn has_max_runtime(&self) -> bool {
        self.params.get("max_runtime").is_some_and(|v| !v.is_null())
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.agent.as_str().trim().is_empty() {
            return Err(DomainError::validation("agent must not be empty"));
        }
        if self.dataset_id.trim().is_empty() {
            return Err(DomainError::validation("dataset_id must not be empty"));
        }
        Ok(())
    }
}

/// Everything the repository needs to create a job record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub user_id: UserId,
    pub agent: Agent,
    pub dataset_id: String,
    pub params: JobParams,
    pub gpu_count: Option<u32>,
    pub correlation_id: Option<CorrelationId>,
}

impl NewJob {
    pub fn from_submission(user_id: UserId, submission: &JobSubmission) -> Self {
        Self {
            user_id,
            agent: submission.agent.clone(),
            dataset_id: submission.dataset_id.clone(),
            params: submission.params.clone(),
            gpu_count: submission.gpu_count(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// An orchestrated compute job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub agent: Agent,
    pub dataset_id: String,
    pub status: JobStatus,
    /// Percent complete, 0-100
    pub progress: u8,
    pub params: JobParams,
    pub result: Option<JobResult>,
    /// Identifier assigned by the HPC scheduler
    pub scheduler_job_id: Option<String>,
    pub gpu_count: Option<u32>,
    /// Correlation chain the job's events belong to
    pub correlation_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff status is COMPLETED or FAILED
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh `QUEUED` record.
    pub fn create(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            user_id: new.user_id,
            agent: new.agent,
            dataset_id: new.dataset_id,
            status: JobStatus::Queued,
            progress: 0,
            params: new.params,
            result: None,
            scheduler_job_id: None,
            gpu_count: new.gpu_count,
            correlation_id: new.correlation_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `status`, keeping the completion timestamp invariant.
    pub fn set_status(&mut self, status: JobStatus, progress: Option<u8>) {
        let now = Utc::now();
        self.status = status;
        if let Some(p) = progress {
            self.progress = p.min(100);
        }
        self.completed_at = if status.marks_completion() {
            self.completed_at.or(Some(now))
        } else {
            None
        };
        self.updated_at = now;
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
        self.updated_at = Utc::now();
    }

    /// Merge non-empty result fields into the existing result.
    pub fn merge_result(&mut self, result: JobResult) {
        let current = self.result.get_or_insert_with(JobResult::default);
        if result.output_url.is_some() {
            current.output_url = result.output_url;
        }
        if result.error_message.is_some() {
            current.error_message = result.error_message;
        }
        current.metrics.extend(result.metrics);
        self.updated_at = Utc::now();
    }

    /// Wall-clock run time of a finished job.
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.created_at).num_milliseconds())
    }
}

/// Search criteria. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSearchFilters {
    pub user_id: Option<UserId>,
    pub agent: Option<Agent>,
    pub status: Option<JobStatus>,
    pub dataset_id: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

impl JobSearchFilters {
    pub fn matches(&self, job: &Job) -> bool {
        self.user_id.as_ref().is_none_or(|u| &job.user_id == u)
            && self.agent.as_ref().is_none_or(|a| &job.agent == a)
            && self.status.is_none_or(|s| job.status == s)
            && self.dataset_id.as_ref().is_none_or(|d| &job.dataset_id == d)
            && self.from_date.is_none_or(|from| job.created_at >= from)
            && self.to_date.is_none_or(|to| job.created_at <= to)
    }
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}
