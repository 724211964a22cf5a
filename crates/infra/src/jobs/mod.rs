//! Job orchestration: records, scheduler access and the lifecycle state machine.

pub mod advisor;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;
pub mod types;
pub mod usage;

pub use advisor::{optimization_tips, OptimizationTip, TipCategory, TipSeverity};
pub use orchestrator::{BatchRequest, JobOrchestrator, OrchestratorError, DEFAULT_PARALLEL_LIMIT};
pub use repository::{InMemoryJobRepository, JobRepository, RepositoryError};
pub use scheduler::{InMemoryScheduler, RemoteStatus, RemoteSubmission, SchedulerClient, SchedulerError};
pub use types::{
    Agent, Job, JobId, JobParams, JobResult, JobSearchFilters, JobStatus, JobSubmission, NewJob, Page,
};
pub use usage::ResourceMetrics;
