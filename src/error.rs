use thiserror::Error;

use crate::scheduler::job::{JobId, JobState};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("State conflict on job {job_id}: expected {expected}, found {actual}")]
    Conflict {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error("Invalid transition on job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {job_id} is waiting on dependency {dependency}")]
    DependencyUnmet { job_id: JobId, dependency: JobId },

    #[error("Job {job_id} is still a dependency of unfinished job {dependent}")]
    DependencyInUse { job_id: JobId, dependent: JobId },

    #[error("Job {job_id} failed on attempt {attempt}: {error}")]
    ExecutionFailure {
        job_id: JobId,
        attempt: u32,
        error: String,
    },

    #[error("Job {job_id} timed out after {timeout_ms}ms")]
    Timeout { job_id: JobId, timeout_ms: u64 },

    #[error("Job {job_id} exhausted after {attempts} attempts: {}", last_error.as_deref().unwrap_or("no error captured"))]
    Exhausted {
        job_id: JobId,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("Job {job_id} cancelled after {attempts} attempts")]
    Cancelled {
        job_id: JobId,
        attempts: u32,
        reason: Option<String>,
    },

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Job store at capacity ({0} jobs)")]
    CapacityExceeded(usize),

    #[error("Invalid job definition: {0}")]
    InvalidDefinition(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Whether the retry policy may recover from this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ExecutionFailure { .. } | OrchestratorError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
