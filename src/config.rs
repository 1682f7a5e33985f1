use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::backoff::RetryPolicy;
use crate::scheduler::job::JobDefinition;

/// Docker sandbox for the shell executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image to use for job execution
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Configuration for [`ShellExecutor`](crate::worker::ShellExecutor).
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell used when no sandbox is configured
    pub shell: String,
    /// Run commands in a Docker container instead of the host shell
    pub sandbox: Option<SandboxConfig>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            sandbox: None,
        }
    }
}

impl ShellConfig {
    pub fn sandboxed(sandbox: SandboxConfig) -> Self {
        Self {
            sandbox: Some(sandbox),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of worker slots. Fixed for the lifetime of the orchestrator.
    pub worker_capacity: usize,
    /// Number of dispatcher loops pulling from the queue
    pub dispatchers: usize,
    /// Upper bound on stored jobs; submissions beyond it are rejected
    pub max_jobs: usize,
    /// Buffer size of the lifecycle event channel
    pub event_capacity: usize,
    /// How long cancelled attempts get to stop before their slot is reclaimed
    pub shutdown_grace_ms: u64,
    pub retry: RetryPolicy,
    /// Used by the CLI when a job file omits `timeout_ms`
    pub default_timeout_ms: u64,
    /// Used by the CLI when a job file omits `max_attempts`
    pub default_max_attempts: u32,
    /// Snapshot file loaded on start and written on shutdown
    pub state_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_capacity: 4,
            dispatchers: 1,
            max_jobs: 10_000,
            event_capacity: 1024,
            shutdown_grace_ms: 5_000,
            retry: RetryPolicy::default(),
            default_timeout_ms: JobDefinition::DEFAULT_TIMEOUT_MS,
            default_max_attempts: JobDefinition::DEFAULT_MAX_ATTEMPTS,
            state_path: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(worker_capacity: usize) -> Self {
        Self {
            worker_capacity,
            ..Default::default()
        }
    }

    pub fn with_dispatchers(mut self, dispatchers: usize) -> Self {
        self.dispatchers = dispatchers;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
