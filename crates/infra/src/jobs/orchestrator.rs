//! Job orchestrator: the job state machine and its lifecycle events.
//!
//! The orchestrator owns every status transition. Each transition is persisted
//! first and then announced through the [`EventPublisher`]; a bus outage never
//! fails a job operation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use horizon_core::{CorrelationId, DomainError, UserId};
use horizon_events::payloads::{JobCancelled, JobCompleted, JobFailed, JobStatusChanged, JobSubmitted};

use super::advisor::{OptimizationTip, optimization_tips};
use super::repository::{JobRepository, RepositoryError};
use super::scheduler::{RemoteStatus, SchedulerClient, SchedulerError};
use super::types::{Job, JobId, JobResult, JobSearchFilters, JobStatus, JobSubmission, NewJob, Page};
use super::usage::{ResourceMetrics, USAGE_WINDOW};
use crate::publisher::EventPublisher;

/// Default number of submissions in flight during a batch.
pub const DEFAULT_PARALLEL_LIMIT: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// A batch of submissions, sent `parallel_limit` at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub jobs: Vec<JobSubmission>,
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
}

fn default_parallel_limit() -> usize {
    DEFAULT_PARALLEL_LIMIT
}

impl BatchRequest {
    pub fn new(jobs: Vec<JobSubmission>) -> Self {
        Self {
            jobs,
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
        }
    }

    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = limit;
        self
    }
}

pub struct JobOrchestrator<R, S> {
    repository: R,
    scheduler: S,
    publisher: Arc<EventPublisher>,
}

impl<R, S> JobOrchestrator<R, S>
where
    R: JobRepository,
    S: SchedulerClient,
{
    pub fn new(repository: R, scheduler: S, publisher: Arc<EventPublisher>) -> Self {
        Self {
            repository,
            scheduler,
            publisher,
        }
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    /// Persist a job, announce it and hand it to the scheduler.
    ///
    /// A scheduler rejection leaves the job `FAILED` (with the error recorded)
    /// and is returned to the caller.
    #[instrument(skip(self, submission), fields(user_id = %user_id, agent = %submission.agent), err)]
    pub async fn submit_job(&self, user_id: &UserId, submission: &JobSubmission) -> Result<Job, OrchestratorError> {
        submission.validate()?;

        let correlation_id = CorrelationId::new();
        let job = self
            .repository
            .create(NewJob::from_submission(user_id.clone(), submission).with_correlation(correlation_id))
            .await?;

        self.publisher
            .publish_event(
                correlation_id,
                user_id.clone(),
                JobSubmitted {
                    job_id: job.id,
                    agent: job.agent.to_string(),
                    dataset_id: job.dataset_id.clone(),
                    gpu_count: job.gpu_count,
                    params: JsonValue::Object(job.params.clone()),
                },
            )
            .await;

        let remote = match self.scheduler.submit(submission).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "scheduler rejected job");
                self.repository.update_status(job.id, JobStatus::Failed, None).await?;
                self.repository
                    .update_result(job.id, JobResult::error(err.to_string()))
                    .await?;
                self.publisher
                    .publish_event(
                        correlation_id,
                        user_id.clone(),
                        JobFailed {
                            job_id: job.id,
                            error_code: err.code().to_string(),
                            error_message: err.to_string(),
                            retry_count: 0,
                            max_retries: 0,
                        },
                    )
                    .await;
                return Err(err.into());
            }
        };

        self.repository
            .update_status(job.id, JobStatus::Queuing, None)
            .await?;
        let job = self
            .repository
            .set_scheduler_job_id(job.id, &remote.remote_job_id)
            .await?;

        self.publisher
            .publish_event(
                correlation_id,
                user_id.clone(),
                JobStatusChanged {
                    job_id: job.id,
                    previous_status: JobStatus::Queued.to_string(),
                    new_status: JobStatus::Queuing.to_string(),
                    reason: None,
                },
            )
            .await;

        info!(job_id = %job.id, remote_job_id = %remote.remote_job_id, "job submitted");
        Ok(job)
    }

    /// Submit jobs in chunks of `parallel_limit`, waiting for each chunk.
    ///
    /// Failed submissions are logged and left out of the result.
    pub async fn submit_batch(&self, user_id: &UserId, batch: &BatchRequest) -> Vec<Job> {
        let mut submitted = Vec::with_capacity(batch.jobs.len());
        for chunk in batch.jobs.chunks(batch.parallel_limit.max(1)) {
            let results =
                futures::future::join_all(chunk.iter().map(|submission| self.submit_job(user_id, submission))).await;
            for result in results {
                match result {
                    Ok(job) => submitted.push(job),
                    Err(err) => warn!(error = %err, "batch submission failed"),
                }
            }
        }
        info!(requested = batch.jobs.len(), submitted = submitted.len(), "batch submitted");
        submitted
    }

    /// Current state of a job, refreshed from the scheduler while it is active.
    ///
    /// A scheduler failure is returned; the stored job is left untouched.
    #[instrument(skip(self), err)]
    pub async fn get_job_status(&self, job_id: JobId) -> Result<Option<Job>, OrchestratorError> {
        let Some(job) = self.repository.find_by_id(job_id).await? else {
            return Ok(None);
        };

        let Some(remote_id) = job.scheduler_job_id.clone() else {
            return Ok(Some(job));
        };
        if !job.status.is_active_upstream() {
            return Ok(Some(job));
        }

        let remote = self.scheduler.status(&remote_id).await.inspect_err(|err| {
            warn!(job_id = %job_id, remote_job_id = %remote_id, error = %err, "status poll failed");
        })?;

        let job = self.apply_remote_status(job, remote).await?;
        Ok(Some(job))
    }

    async fn apply_remote_status(&self, job: Job, remote: RemoteStatus) -> Result<Job, OrchestratorError> {
        let progress = remote.progress_percent();
        let mut updated = self.repository.update_progress(job.id, progress).await?;

        if !remote.status.marks_completion() {
            return Ok(updated);
        }

        let previous = job.status;
        self.repository
            .update_status(job.id, remote.status, Some(progress))
            .await?;
        let result = match remote.status {
            JobStatus::Completed => JobResult {
                output_url: remote.output_url.clone(),
                ..JobResult::default()
            },
            _ => JobResult::error(
                remote
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "job failed on the scheduler".to_string()),
            ),
        };
        updated = self.repository.update_result(job.id, result).await?;

        let correlation_id = job.correlation_id.unwrap_or_default();
        self.publisher
            .publish_event(
                correlation_id,
                job.user_id.clone(),
                JobStatusChanged {
                    job_id: job.id,
                    previous_status: previous.to_string(),
                    new_status: remote.status.to_string(),
                    reason: remote.error_message.clone(),
                },
            )
            .await;

        if remote.status == JobStatus::Completed {
            self.publisher
                .publish_event(
                    correlation_id,
                    job.user_id.clone(),
                    JobCompleted {
                        job_id: job.id,
                        output_url: remote.output_url,
                        execution_time_ms: updated.duration_ms(),
                    },
                )
                .await;
        } else {
            self.publisher
                .publish_event(
                    correlation_id,
                    job.user_id.clone(),
                    JobFailed {
                        job_id: job.id,
                        error_code: "SCHEDULER_FAILURE".to_string(),
                        error_message: remote
                            .error_message
                            .unwrap_or_else(|| "job failed on the scheduler".to_string()),
                        retry_count: 0,
                        max_retries: 0,
                    },
                )
                .await;
        }

        info!(job_id = %job.id, status = %remote.status, "job finished upstream");
        Ok(updated)
    }

    /// Cancel a job. Returns `false` when it does not exist or already finished.
    ///
    /// A scheduler failure is returned and the job keeps its status.
    #[instrument(skip(self), err)]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, OrchestratorError> {
        let Some(job) = self.repository.find_by_id(job_id).await? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }

        if let Some(remote_id) = &job.scheduler_job_id {
            let known = self.scheduler.cancel(remote_id).await.inspect_err(|err| {
                warn!(job_id = %job_id, remote_job_id = %remote_id, error = %err, "scheduler cancel failed");
            })?;
            if !known {
                warn!(job_id = %job_id, remote_job_id = %remote_id, "scheduler did not know the job");
            }
        }

        self.repository
            .update_status(job_id, JobStatus::Cancelled, None)
            .await?;

        self.publisher
            .publish_event(
                job.correlation_id.unwrap_or_default(),
                job.user_id.clone(),
                JobCancelled {
                    job_id,
                    cancelled_by: "user".to_string(),
                    reason: "User requested cancellation".to_string(),
                },
            )
            .await;

        info!(job_id = %job_id, "job cancelled");
        Ok(true)
    }

    pub fn optimization_tips(&self, submission: &JobSubmission) -> Vec<OptimizationTip> {
        optimization_tips(submission)
    }

    /// Usage summary over the user's most recent jobs.
    pub async fn resource_metrics(&self, user_id: &UserId) -> Result<ResourceMetrics, OrchestratorError> {
        let page = self.repository.find_by_user(user_id, USAGE_WINDOW, 0).await?;
        Ok(ResourceMetrics::from_jobs(&page.items))
    }

    pub async fn job_history(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Job>, OrchestratorError> {
        Ok(self.repository.find_by_user(user_id, limit, offset).await?)
    }

    /// Search within the user's own jobs; any `user_id` in the filters is replaced.
    pub async fn search_jobs(
        &self,
        user_id: &UserId,
        filters: JobSearchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Job>, OrchestratorError> {
        let filters = JobSearchFilters {
            user_id: Some(user_id.clone()),
            ..filters
        };
        Ok(self.repository.search(&filters, limit, offset).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::repository::InMemoryJobRepository;
    use crate::jobs::scheduler::InMemoryScheduler;
    use crate::jobs::types::Agent;
    use horizon_events::{Channel, EventEnvelope, InMemoryDurableBus, InMemoryEphemeralBus, event_types};

    struct Fixture {
        orchestrator: JobOrchestrator<Arc<InMemoryJobRepository>, Arc<InMemoryScheduler>>,
        scheduler: Arc<InMemoryScheduler>,
        ephemeral: Arc<InMemoryEphemeralBus>,
        durable: Arc<InMemoryDurableBus>,
    }

    fn fixture() -> Fixture {
        let ephemeral = Arc::new(InMemoryEphemeralBus::new());
        let durable = Arc::new(InMemoryDurableBus::new());
        let scheduler = Arc::new(InMemoryScheduler::new());
        let publisher = Arc::new(EventPublisher::new(ephemeral.clone(), durable.clone()));
        Fixture {
            orchestrator: JobOrchestrator::new(InMemoryJobRepository::arc(), scheduler.clone(), publisher),
            scheduler,
            ephemeral,
            durable,
        }
    }

    fn lifecycle_types(durable: &InMemoryDurableBus) -> Vec<String> {
        durable
            .records(Channel::JobLifecycle)
            .iter()
            .map(|r| {
                let env: EventEnvelope = serde_json::from_str(&r.payload).unwrap();
                env.event_type().to_string()
            })
            .collect()
    }

    fn alphacal() -> JobSubmission {
        JobSubmission::new(Agent::AlphaCal, "ngc-1234").with_param("gpu_count", 4)
    }

    #[tokio::test]
    async fn submit_moves_job_to_queuing_and_announces_it() {
        let f = fixture();
        let user = UserId::from("u1");

        let job = f.orchestrator.submit_job(&user, &alphacal()).await.unwrap();

        assert_eq!(job.status, JobStatus::Queuing);
        assert_eq!(job.scheduler_job_id.as_deref(), Some("hpc-1"));
        assert!(job.correlation_id.is_some());
        assert_eq!(
            lifecycle_types(&f.durable),
            vec![event_types::JOB_SUBMITTED, event_types::JOB_STATUS_CHANGED]
        );
    }

    #[tokio::test]
    async fn every_event_of_a_job_shares_its_correlation_id() {
        let f = fixture();
        let job = f.orchestrator.submit_job(&UserId::from("u1"), &alphacal()).await.unwrap();
        f.orchestrator.cancel_job(job.id).await.unwrap();

        let correlation = job.correlation_id.unwrap();
        for record in f.durable.records(Channel::JobLifecycle) {
            let env: EventEnvelope = serde_json::from_str(&record.payload).unwrap();
            assert_eq!(env.correlation_id(), correlation);
        }
    }

    #[tokio::test]
    async fn scheduler_rejection_fails_the_job() {
        let f = fixture();
        f.scheduler.reject_dataset("missing");
        let user = UserId::from("u1");

        let err = f
            .orchestrator
            .submit_job(&user, &JobSubmission::new(Agent::AlphaCal, "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Scheduler(SchedulerError::Rejected(_))));

        let history = f.orchestrator.job_history(&user, 10, 0).await.unwrap();
        let job = &history.items[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert!(job.result.as_ref().unwrap().error_message.is_some());
        assert_eq!(
            lifecycle_types(&f.durable),
            vec![event_types::JOB_SUBMITTED, event_types::JOB_FAILED]
        );
    }

    #[tokio::test]
    async fn invalid_submission_is_refused_before_persisting() {
        let f = fixture();
        let user = UserId::from("u1");
        let err = f
            .orchestrator
            .submit_job(&user, &JobSubmission::new(Agent::AlphaCal, " "))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Domain(_)));
        assert_eq!(f.orchestrator.job_history(&user, 10, 0).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn submission_survives_a_bus_outage() {
        let f = fixture();
        f.ephemeral.set_online(false);
        f.durable.set_online(false);

        let job = f.orchestrator.submit_job(&UserId::from("u1"), &alphacal()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queuing);
    }

    #[tokio::test]
    async fn poll_records_progress_while_running() {
        let f = fixture();
        let job = f.orchestrator.submit_job(&UserId::from("u1"), &alphacal()).await.unwrap();
        f.scheduler.set_status(
            "hpc-1",
            RemoteStatus {
                status: JobStatus::Running,
                progress: 0.42,
                output_url: None,
                error_message: None,
            },
        );

        let polled = f.orchestrator.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(polled.progress, 42);
        assert_eq!(polled.status, JobStatus::Queuing);
        assert_eq!(lifecycle_types(&f.durable).len(), 2);
    }

    #[tokio::test]
    async fn poll_completes_the_job_and_publishes_terminal_events() {
        let f = fixture();
        let job = f.orchestrator.submit_job(&UserId::from("u1"), &alphacal()).await.unwrap();
        f.scheduler.set_status(
            "hpc-1",
            RemoteStatus {
                status: JobStatus::Completed,
                progress: 1.0,
                output_url: Some("s3://results/1".into()),
                error_message: None,
            },
        );

        let polled = f.orchestrator.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(polled.status, JobStatus::Completed);
        assert_eq!(polled.progress, 100);
        assert!(polled.completed_at.is_some());
        assert_eq!(
            polled.result.unwrap().output_url.as_deref(),
            Some("s3://results/1")
        );
        assert_eq!(
            lifecycle_types(&f.durable)[2..],
            [event_types::JOB_STATUS_CHANGED, event_types::JOB_COMPLETED]
        );

        // Terminal jobs are not polled again.
        f.scheduler.set_offline(true);
        let again = f.orchestrator.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(again.status, JobStatus::Completed);
        assert_eq!(lifecycle_types(&f.durable).len(), 4);
    }

    #[tokio::test]
    async fn poll_failure_is_returned_and_job_is_unchanged() {
        let f = fixture();
        let job = f.orchestrator.submit_job(&UserId::from("u1"), &alphacal()).await.unwrap();
        f.scheduler.set_offline(true);

        let err = f.orchestrator.get_job_status(job.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Scheduler(SchedulerError::Unavailable(_))));

        f.scheduler.set_offline(false);
        let polled = f.orchestrator.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(polled.status, JobStatus::Queuing);
        assert_eq!(lifecycle_types(&f.durable).len(), 2);
    }

    #[tokio::test]
    async fn unknown_job_status_is_none() {
        let f = fixture();
        assert!(f.orchestrator.get_job_status(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_reaches_scheduler_and_is_final() {
        let f = fixture();
        let job = f.orchestrator.submit_job(&UserId::from("u1"), &alphacal()).await.unwrap();

        assert!(f.orchestrator.cancel_job(job.id).await.unwrap());
        assert_eq!(f.scheduler.cancelled(), vec!["hpc-1".to_string()]);

        let cancelled = f.orchestrator.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_none());
        assert_eq!(lifecycle_types(&f.durable).last().unwrap(), event_types::JOB_CANCELLED);

        assert!(!f.orchestrator.cancel_job(job.id).await.unwrap());
        assert!(!f.orchestrator.cancel_job(JobId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_failure_is_returned_and_job_keeps_running() {
        let f = fixture();
        let job = f.orchestrator.submit_job(&UserId::from("u1"), &alphacal()).await.unwrap();
        f.scheduler.set_offline(true);

        let err = f.orchestrator.cancel_job(job.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Scheduler(_)));

        f.scheduler.set_offline(false);
        let stored = f.orchestrator.get_job_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queuing);
        assert!(!lifecycle_types(&f.durable).contains(&event_types::JOB_CANCELLED.to_string()));
        assert!(f.scheduler.cancelled().is_empty());
    }

    #[tokio::test]
    async fn batch_skips_failed_submissions() {
        let f = fixture();
        f.scheduler.reject_dataset("bad");
        let batch = BatchRequest::new(vec![
            alphacal(),
            JobSubmission::new(Agent::AnomalyDetection, "bad"),
            JobSubmission::new(Agent::ImageReconstruction, "m31"),
            alphacal(),
        ])
        .with_parallel_limit(0);

        let jobs = f.orchestrator.submit_batch(&UserId::from("u1"), &batch).await;
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Queuing));
    }

    #[tokio::test]
    async fn hanging_durable_bus_does_not_stall_submission() {
        use crate::publisher::test_support::HangingDurableBus;
        use std::time::Duration;

        let ephemeral = Arc::new(InMemoryEphemeralBus::new());
        let publisher = Arc::new(
            EventPublisher::new(ephemeral, Arc::new(HangingDurableBus)).with_publish_timeout(Duration::from_millis(20)),
        );
        let orchestrator =
            JobOrchestrator::new(InMemoryJobRepository::arc(), Arc::new(InMemoryScheduler::new()), publisher.clone());

        let job = tokio::time::timeout(
            Duration::from_secs(2),
            orchestrator.submit_job(&UserId::from("u1"), &alphacal()),
        )
        .await
        .expect("submission must not wait on a hung transport")
        .unwrap();

        assert_eq!(job.status, JobStatus::Queuing);
        assert_eq!(publisher.stats().failed, 2);
    }

    #[tokio::test]
    async fn batch_runs_in_sequential_chunks() {
        let f = fixture();
        f.scheduler.set_latency(std::time::Duration::from_millis(20));
        let batch = BatchRequest::new((0..5).map(|i| JobSubmission::new(Agent::AlphaCal, format!("ds-{i}"))).collect())
            .with_parallel_limit(2);

        let jobs = f.orchestrator.submit_batch(&UserId::from("u1"), &batch).await;

        assert_eq!(jobs.len(), 5);
        assert_eq!(f.scheduler.max_in_flight(), 2);
        // ceil(5 / 2) chunks, each drained before the next starts
        assert_eq!(f.scheduler.drains(), 3);
    }

    #[tokio::test]
    async fn search_is_scoped_to_the_caller() {
        let f = fixture();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        f.orchestrator.submit_job(&alice, &alphacal()).await.unwrap();
        f.orchestrator.submit_job(&bob, &alphacal()).await.unwrap();

        let filters = JobSearchFilters {
            user_id: Some(bob.clone()),
            ..JobSearchFilters::default()
        };
        let page = f.orchestrator.search_jobs(&alice, filters, 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].user_id, alice);
    }

    #[tokio::test]
    async fn resource_metrics_cover_user_jobs() {
        let f = fixture();
        let user = UserId::from("u1");
        f.orchestrator.submit_job(&user, &alphacal()).await.unwrap();
        f.orchestrator.submit_job(&user, &alphacal()).await.unwrap();

        let metrics = f.orchestrator.resource_metrics(&user).await.unwrap();
        assert_eq!(metrics.total_gpu_count, 8);
    }
}
