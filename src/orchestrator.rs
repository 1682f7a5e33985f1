use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::scheduler::{
    DependencyIndex, Job, JobDefinition, JobFilter, JobId, JobQueue, JobState, JobStore, Scheduler,
};
use crate::worker::{JobHandler, WorkerPool};

/// Owns every component and exposes the submission, query and cancellation
/// API.
///
/// Nothing here is global: each collaborator holds an `Arc` to the pieces it
/// needs, handed out by this struct.
pub struct Orchestrator {
    config: OrchestratorConfig,
    events: EventBus,
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    /// Cancelled once `shutdown` has drained every attempt.
    stopped: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

impl Orchestrator {
    /// Build the orchestrator. When `config.state_path` points at an existing
    /// snapshot, the store is loaded from it; call [`start`](Self::start) to
    /// resume those jobs.
    pub fn new(config: OrchestratorConfig, handler: Arc<dyn JobHandler>) -> Result<Self> {
        let events = EventBus::new(config.event_capacity);

        let store = match &config.state_path {
            Some(path) if path.exists() => JobStore::load(path, events.clone(), config.max_jobs)?,
            _ => JobStore::with_capacity(events.clone(), config.max_jobs),
        };
        let store = Arc::new(store);
        let queue = Arc::new(JobQueue::new());
        let pool = Arc::new(WorkerPool::new(config.worker_capacity, handler));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            pool.clone(),
            Arc::new(DependencyIndex::new()),
            config.retry.clone(),
            config.shutdown_grace(),
            shutdown.clone(),
            tasks.clone(),
        ));

        Ok(Self {
            config,
            events,
            store,
            queue,
            pool,
            scheduler,
            shutdown,
            stopped: CancellationToken::new(),
            tasks,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the dispatcher loops and re-admit recovered jobs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.store.is_empty() {
            self.scheduler.recover()?;
        }

        let dispatchers = self.config.dispatchers.max(1);
        for dispatcher in 0..dispatchers {
            let scheduler = self.scheduler.clone();
            self.tasks.spawn(async move {
                scheduler.run(dispatcher).await;
            });
        }
        tracing::info!(
            workers = self.pool.capacity(),
            dispatchers,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Store a new job and queue it for dispatch.
    pub fn submit(&self, definition: JobDefinition) -> Result<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        definition.validate()?;
        for dep in &definition.dependencies {
            self.store.get(dep)?;
        }

        let job = Job::new(definition);
        let job_id = job.id;
        self.store.put(job.clone())?;
        tracing::info!(
            job_id = %job_id,
            name = %job.definition.name,
            priority = job.definition.priority,
            dependencies = job.definition.dependencies.len(),
            "Job submitted"
        );
        self.scheduler.admit(&job)?;
        Ok(job_id)
    }

    pub fn get(&self, job_id: &JobId) -> Result<Job> {
        self.store.get(job_id)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.store.list(filter)
    }

    pub fn cancel(&self, job_id: &JobId) -> Result<Job> {
        self.scheduler.cancel(job_id, None)
    }

    /// Delete a finished job.
    pub fn remove(&self, job_id: &JobId) -> Result<Job> {
        self.store.remove(job_id)
    }

    pub fn purge_finished(&self) -> usize {
        self.store.purge_finished()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> impl Stream<Item = LifecycleEvent> + Send + 'static {
        self.events.stream()
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// Returns the job once it has succeeded. Otherwise the error carries
    /// the attempt count and the last captured error. A job that is still
    /// pending or waiting to retry when shutdown completes yields
    /// `ShuttingDown`.
    pub async fn wait(&self, job_id: &JobId) -> Result<Job> {
        let mut rx = self.events.subscribe();
        loop {
            let job = self.store.get(job_id)?;
            match job.state {
                JobState::Succeeded => return Ok(job),
                JobState::Exhausted => {
                    return Err(OrchestratorError::Exhausted {
                        job_id: *job_id,
                        attempts: job.attempts,
                        last_error: job.last_error,
                    })
                }
                JobState::Cancelled => {
                    return Err(OrchestratorError::Cancelled {
                        job_id: *job_id,
                        attempts: job.attempts,
                        reason: job.last_error,
                    })
                }
                JobState::Pending | JobState::Running | JobState::Failed => {}
            }
            if self.stopped.is_cancelled() {
                return Err(OrchestratorError::ShuttingDown);
            }

            loop {
                let received = tokio::select! {
                    _ = self.stopped.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) if event.job_id == *job_id && event.to.is_terminal() => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(OrchestratorError::ShuttingDown)
                    }
                }
            }
        }
    }

    /// Stop dispatching, cancel running attempts and wait for them to drain.
    ///
    /// Attempts that are still running after the grace period have their
    /// slots reclaimed. The store is saved to `state_path` if one is set.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let grace = self.config.shutdown_grace();
        tracing::info!(
            grace_ms = self.config.shutdown_grace_ms,
            busy = self.pool.busy(),
            "Shutting down orchestrator"
        );

        self.shutdown.cancel();
        self.queue.close();
        self.pool.close();
        self.pool.cancel_all();

        if tokio::time::timeout(grace, self.pool.wait_idle()).await.is_err() {
            self.pool.reclaim_all();
        }

        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!("Background tasks still running after grace period");
        }

        self.stopped.cancel();
        if let Some(path) = &self.config.state_path {
            self.store.save(path)?;
        }
        tracing::info!("Orchestrator stopped");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}
