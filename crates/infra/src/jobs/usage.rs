//! Per-user resource usage summary.

use serde::{Deserialize, Serialize};

use super::types::{Job, JobStatus};

/// How many recent jobs a usage summary covers.
pub const USAGE_WINDOW: usize = 1000;

/// Estimated price of one GPU-hour, in USD.
pub const GPU_HOUR_COST_USD: f64 = 0.35;

const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub total_gpu_count: u64,
    /// Mean wall-clock duration of completed jobs, in milliseconds
    pub average_runtime_ms: f64,
    pub estimated_cost_usd: f64,
    /// Percentage of jobs that completed, 0-100
    pub success_rate: f64,
}

impl ResourceMetrics {
    /// Summarize a set of jobs (the caller picks the window).
    pub fn from_jobs(jobs: &[Job]) -> Self {
        if jobs.is_empty() {
            return Self::default();
        }

        let total_gpu_count: u64 = jobs.iter().map(|j| u64::from(j.gpu_count.unwrap_or(0))).sum();

        let runtimes: Vec<i64> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .filter_map(Job::duration_ms)
            .filter(|ms| *ms > 0)
            .collect();
        let average_runtime_ms = if runtimes.is_empty() {
            0.0
        } else {
            runtimes.iter().sum::<i64>() as f64 / runtimes.len() as f64
        };

        let completed = jobs.iter().filter(|j| j.status == JobStatus::Completed).count();
        let success_rate = completed as f64 / jobs.len() as f64 * 100.0;

        let estimated_cost_usd =
            total_gpu_count as f64 * (average_runtime_ms / MS_PER_HOUR) * GPU_HOUR_COST_USD;

        Self {
            total_gpu_count,
            average_runtime_ms,
            estimated_cost_usd,
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{Agent, JobSubmission, NewJob};
    use chrono::Duration;
    use horizon_core::UserId;

    fn job(gpus: u32, status: JobStatus, runtime: Option<Duration>) -> Job {
        let submission = JobSubmission::new(Agent::AlphaCal, "d").with_param("gpu_count", gpus);
        let mut job = Job::create(NewJob::from_submission(UserId::new("u"), &submission));
        job.status = status;
        job.completed_at = runtime.map(|r| job.created_at + r);
        job
    }

    #[test]
    fn empty_history_is_all_zero() {
        assert_eq!(ResourceMetrics::from_jobs(&[]), ResourceMetrics::default());
    }

    #[test]
    fn averages_completed_runtimes_and_prices_gpu_hours() {
        let jobs = vec![
            job(2, JobStatus::Completed, Some(Duration::hours(1))),
            job(2, JobStatus::Completed, Some(Duration::hours(3))),
            job(4, JobStatus::Failed, Some(Duration::hours(10))),
            job(0, JobStatus::Running, None),
        ];
        let metrics = ResourceMetrics::from_jobs(&jobs);

        assert_eq!(metrics.total_gpu_count, 8);
        assert_eq!(metrics.average_runtime_ms, 2.0 * MS_PER_HOUR);
        assert_eq!(metrics.success_rate, 50.0);
        assert!((metrics.estimated_cost_usd - 8.0 * 2.0 * 0.35).abs() < 1e-9);
    }

    #[test]
    fn completed_jobs_without_timestamps_do_not_skew_the_average() {
        let jobs = vec![
            job(1, JobStatus::Completed, None),
            job(1, JobStatus::Completed, Some(Duration::minutes(30))),
        ];
        let metrics = ResourceMetrics::from_jobs(&jobs);
        assert_eq!(metrics.average_runtime_ms, 30.0 * 60_000.0);
        assert_eq!(metrics.success_rate, 100.0);
    }
}
