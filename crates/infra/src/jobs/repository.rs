//! Job persistence.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use horizon_core::UserId;

use super::types::{Job, JobId, JobResult, JobSearchFilters, JobStatus, NewJob, Page};

/// Job repository error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job repository abstraction.
///
/// Listing operations return newest jobs first (`created_at` descending).
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a new `QUEUED` job with progress 0.
    async fn create(&self, new: NewJob) -> Result<Job, RepositoryError>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, RepositoryError>;

    async fn find_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Job>, RepositoryError>;

    async fn search(
        &self,
        filters: &JobSearchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Job>, RepositoryError>;

    /// Set the status (and optionally progress). Stamps `completed_at` for
    /// COMPLETED/FAILED and clears it otherwise.
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        progress: Option<u8>,
    ) -> Result<Job, RepositoryError>;

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<Job, RepositoryError>;

    async fn update_result(&self, id: JobId, result: JobResult) -> Result<Job, RepositoryError>;

    async fn set_scheduler_job_id(&self, id: JobId, remote_id: &str) -> Result<Job, RepositoryError>;
}

/// In-memory job repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn modify(&self, id: JobId, f: impl FnOnce(&mut Job)) -> Result<Job, RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        f(job);
        Ok(job.clone())
    }

    fn page(&self, keep: impl Fn(&Job) -> bool, limit: usize, offset: usize) -> Page<Job> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<Job> = jobs.values().filter(|j| keep(j)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = matching.len();
        let items = matching.into_iter().skip(offset).take(limit).collect();
        Page { items, total }
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, new: NewJob) -> Result<Job, RepositoryError> {
        let job = Job::create(new);
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, RepositoryError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&id).cloned())
    }

    async fn find_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Job>, RepositoryError> {
        Ok(self.page(|j| &j.user_id == user_id, limit, offset))
    }

    async fn search(
        &self,
        filters: &JobSearchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Job>, RepositoryError> {
        Ok(self.page(|j| filters.matches(j), limit, offset))
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        progress: Option<u8>,
    ) -> Result<Job, RepositoryError> {
        self.modify(id, |job| job.set_status(status, progress))
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<Job, RepositoryError> {
        self.modify(id, |job| job.set_progress(progress))
    }

    async fn update_result(&self, id: JobId, result: JobResult) -> Result<Job, RepositoryError> {
        self.modify(id, |job| job.merge_result(result))
    }

    async fn set_scheduler_job_id(&self, id: JobId, remote_id: &str) -> Result<Job, RepositoryError> {
        self.modify(id, |job| {
            job.scheduler_job_id = Some(remote_id.to_string());
            job.updated_at = chrono::Utc::now();
        })
    }
}

// Allow using `Arc<Repo>` anywhere a `JobRepository` is expected.
#[async_trait]
impl<R> JobRepository for Arc<R>
where
    R: JobRepository + ?Sized,
{
    async fn create(&self, new: NewJob) -> Result<Job, RepositoryError> {
        (**self).create(new).await
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, RepositoryError> {
        (**self).find_by_id(id).await
    }

    async fn find_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Job>, RepositoryError> {
        (**self).find_by_user(user_id, limit, offset).await
    }

    async fn search(
        &self,
        filters: &JobSearchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Job>, RepositoryError> {
        (**self).search(filters, limit, offset).await
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        progress: Option<u8>,
    ) -> Result<Job, RepositoryError> {
        (**self).update_status(id, status, progress).await
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<Job, RepositoryError> {
        (**self).update_progress(id, progress).await
    }

    async fn update_result(&self, id: JobId, result: JobResult) -> Result<Job, RepositoryError> {
        (**self).update_result(id, result).await
    }

    async fn set_scheduler_job_id(&self, id: JobId, remote_id: &str) -> Result<Job, RepositoryError> {
        (**self).set_scheduler_job_id(id, remote_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{Agent, JobSubmission};

    fn new_job(user: &str, dataset: &str) -> NewJob {
        NewJob::from_submission(UserId::new(user), &JobSubmission::new(Agent::AlphaCal, dataset))
    }

    #[tokio::test]
    async fn find_by_user_pages_newest_first() {
        let repo = InMemoryJobRepository::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(repo.create(new_job("u1", &format!("d{i}"))).await.unwrap().id);
        }
        repo.create(new_job("u2", "other")).await.unwrap();

        let page = repo.find_by_user(&UserId::new("u1"), 2, 1).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        // UUIDv7 ids are time ordered, so newest-first means descending ids.
        assert_eq!(page.items[0].id, ids[3]);
        assert_eq!(page.items[1].id, ids[2]);
    }

    #[tokio::test]
    async fn update_status_stamps_completion_for_terminal_success_and_failure() {
        let repo = InMemoryJobRepository::new();
        let job = repo.create(new_job("u1", "d")).await.unwrap();

        let running = repo.update_status(job.id, JobStatus::Running, Some(40)).await.unwrap();
        assert!(running.completed_at.is_none());
        assert_eq!(running.progress, 40);

        let done = repo.update_status(job.id, JobStatus::Completed, Some(100)).await.unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn missing_job_updates_fail() {
        let repo = InMemoryJobRepository::new();
        let err = repo.update_progress(JobId::new(), 10).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn search_applies_filters() {
        let repo = InMemoryJobRepository::new();
        let a = repo.create(new_job("u1", "alpha")).await.unwrap();
        repo.create(new_job("u1", "beta")).await.unwrap();
        repo.update_status(a.id, JobStatus::Failed, None).await.unwrap();

        let filters = JobSearchFilters {
            user_id: Some(UserId::new("u1")),
            status: Some(JobStatus::Failed),
            ..Default::default()
        };
        let page = repo.search(&filters, 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, a.id);
    }
}
