use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::backoff::RetryPolicy;
use crate::scheduler::deps::{readiness, DependencyIndex, Readiness};
use crate::scheduler::job::{Attempt, AttemptOutcome, Job, JobId, JobState};
use crate::scheduler::queue::JobQueue;
use crate::scheduler::store::JobStore;
use crate::worker::pool::{AttemptReport, SlotHandle, WorkerPool};

/// The control loop.
///
/// Dispatchers pull job ids from the queue, check dependencies, reserve a
/// worker slot, claim the job with a `Pending -> Running` CAS and hand it to
/// the pool. Each attempt gets a supervisor task that enforces the job's
/// deadline and feeds the outcome back through [`Scheduler::complete`].
///
/// Several dispatchers may run against the same queue. Per-job transitions
/// stay single-writer because every one goes through the store's CAS.
pub struct Scheduler {
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    deps: Arc<DependencyIndex>,
    retry: RetryPolicy,
    grace: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<JobQueue>,
        pool: Arc<WorkerPool>,
        deps: Arc<DependencyIndex>,
        retry: RetryPolicy,
        grace: Duration,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            store,
            queue,
            pool,
            deps,
            retry,
            grace,
            shutdown,
            tasks,
        }
    }

    /// Dispatcher loop. Runs until shutdown or until the queue closes.
    pub async fn run(self: Arc<Self>, dispatcher: usize) {
        tracing::info!(dispatcher, "Dispatcher started");
        loop {
            let job_id = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Ok(job_id) => job_id,
                    Err(_) => break,
                },
            };

            match self.dispatch(job_id).await {
                Ok(()) => {}
                Err(OrchestratorError::ShuttingDown) | Err(OrchestratorError::QueueClosed) => break,
                Err(e) => {
                    tracing::warn!(dispatcher, job_id = %job_id, error = %e, "Dispatch failed");
                }
            }
        }
        tracing::info!(dispatcher, "Dispatcher stopped");
    }

    /// Route a `Pending` job: enqueue it when its dependencies are met, park
    /// it otherwise.
    pub fn admit(&self, job: &Job) -> Result<()> {
        match self.dispatch_check(job) {
            Ok(()) => self.queue.enqueue(job.id, job.definition.priority),
            Err(OrchestratorError::DependencyUnmet { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Verify the job may run now.
    ///
    /// Returns `DependencyUnmet` when it may not. In that case the job has
    /// been parked on its outstanding dependencies, or cancelled because one
    /// of them can no longer succeed.
    pub fn dispatch_check(&self, job: &Job) -> Result<()> {
        match readiness(&self.store, job) {
            Readiness::Ready => Ok(()),
            Readiness::Waiting(waiting) => {
                self.deps.park(job.id, &waiting);
                // A dependency may have finished between the check and the park.
                self.recheck(&job.id)?;
                Err(OrchestratorError::DependencyUnmet {
                    job_id: job.id,
                    dependency: waiting[0],
                })
            }
            Readiness::Blocked { dependency, state } => {
                self.cancel_blocked(&job.id, &dependency, state)?;
                Err(OrchestratorError::DependencyUnmet {
                    job_id: job.id,
                    dependency,
                })
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, job_id: JobId) -> Result<()> {
        let job = match self.store.get(&job_id) {
            Ok(job) => job,
            Err(OrchestratorError::NotFound(_)) => {
                tracing::warn!(job_id = %job_id, "Queued job no longer in store");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if job.state != JobState::Pending {
            tracing::debug!(job_id = %job_id, state = %job.state, "Skipping stale queue entry");
            return Ok(());
        }

        match self.dispatch_check(&job) {
            Ok(()) => {}
            Err(OrchestratorError::DependencyUnmet { dependency, .. }) => {
                tracing::debug!(job_id = %job_id, dependency = %dependency, "Dependencies unmet at dispatch");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let reservation = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(OrchestratorError::ShuttingDown),
            reservation = self.pool.reserve() => reservation?,
        };
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let job = match self
            .store
            .update_state(&job_id, JobState::Pending, JobState::Running, None)
        {
            Ok(job) => job,
            Err(OrchestratorError::Conflict { actual, .. }) => {
                tracing::debug!(job_id = %job_id, state = %actual, "Job claimed elsewhere, dropping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            job_id = %job_id,
            name = %job.definition.name,
            attempt = job.attempts,
            max_attempts = job.definition.max_attempts,
            slot = reservation.slot(),
            "Job started"
        );

        let handle = match reservation.launch(&job) {
            Ok(handle) => handle,
            Err(e) => {
                let now = Utc::now();
                self.complete(AttemptReport {
                    job_id,
                    attempt: job.attempts,
                    outcome: AttemptOutcome::Failed,
                    output: None,
                    error: Some(e.to_string()),
                    started_at: now,
                    finished_at: now,
                })?;
                return Err(e);
            }
        };

        // Cancelled or shut down between the claim and the launch. The slot is
        // Busy from here on, so a later `cancel_all` reaches it as well.
        if self.shutdown.is_cancelled() || self.store.state(&job_id)? == JobState::Cancelled {
            self.pool.cancel(&handle);
        }

        let this = self.clone();
        let timeout = job.definition.timeout();
        self.tasks.spawn(async move {
            this.supervise(handle, timeout).await;
        });
        Ok(())
    }

    /// Wait for one attempt to finish, enforcing its deadline.
    async fn supervise(self: Arc<Self>, mut handle: SlotHandle, timeout: Duration) {
        let job_id = handle.job_id;
        let attempt = handle.attempt;
        let token = handle.cancellation_token();
        let started_at = Utc::now();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let (report, timed_out) = tokio::select! {
            report = handle.report() => (report, false),
            _ = &mut deadline => {
                tracing::warn!(job_id = %job_id, attempt, timeout_ms = timeout.as_millis() as u64, "Attempt timed out");
                self.pool.cancel(&handle);
                (self.await_grace(&mut handle).await, true)
            }
            _ = token.cancelled() => (self.await_grace(&mut handle).await, false),
        };

        let now = Utc::now();
        let report = if timed_out {
            AttemptReport {
                job_id,
                attempt,
                outcome: AttemptOutcome::TimedOut,
                output: None,
                error: Some(
                    OrchestratorError::Timeout {
                        job_id,
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .to_string(),
                ),
                started_at: report.as_ref().map_or(started_at, |r| r.started_at),
                finished_at: report.as_ref().map_or(now, |r| r.finished_at),
            }
        } else {
            match report {
                Some(report) => report,
                None => {
                    let (outcome, error) = if token.is_cancelled() || self.shutdown.is_cancelled() {
                        (
                            AttemptOutcome::Cancelled,
                            "reclaimed after grace period".to_string(),
                        )
                    } else {
                        (
                            AttemptOutcome::Failed,
                            "handler panicked before reporting".to_string(),
                        )
                    };
                    AttemptReport {
                        job_id,
                        attempt,
                        outcome,
                        output: None,
                        error: Some(error),
                        started_at,
                        finished_at: now,
                    }
                }
            }
        };

        if let Err(e) = self.complete(report) {
            tracing::error!(job_id = %job_id, attempt, error = %e, "Failed to apply attempt outcome");
        }
    }

    async fn await_grace(&self, handle: &mut SlotHandle) -> Option<AttemptReport> {
        match tokio::time::timeout(self.grace, handle.report()).await {
            Ok(report) => report,
            Err(_) => {
                self.pool.reclaim(handle);
                None
            }
        }
    }

    /// Apply the outcome of one attempt.
    ///
    /// Exactly one call per attempt changes anything: the attempt record is
    /// keyed by its number, and a replayed report for an attempt already on
    /// record is ignored.
    pub fn complete(self: &Arc<Self>, report: AttemptReport) -> Result<()> {
        let job_id = report.job_id;
        let recorded = self.store.record_attempt(
            &job_id,
            Attempt {
                number: report.attempt,
                started_at: report.started_at,
                finished_at: report.finished_at,
                outcome: report.outcome,
                error: report.error.clone(),
                output: report.output.clone(),
            },
        )?;
        if !recorded {
            tracing::debug!(job_id = %job_id, attempt = report.attempt, "Duplicate completion ignored");
            return Ok(());
        }

        match report.outcome {
            AttemptOutcome::Succeeded => {
                if self
                    .transition(&job_id, JobState::Running, JobState::Succeeded, None)?
                    .is_some()
                {
                    tracing::info!(job_id = %job_id, attempt = report.attempt, "Job succeeded");
                    self.wake_dependents(&job_id)?;
                }
            }
            AttemptOutcome::Cancelled => {
                if self
                    .transition(&job_id, JobState::Running, JobState::Cancelled, report.error)?
                    .is_some()
                {
                    tracing::info!(job_id = %job_id, attempt = report.attempt, "Job cancelled");
                    self.cancel_dependents(&job_id)?;
                }
            }
            AttemptOutcome::Failed | AttemptOutcome::TimedOut => {
                let message = report
                    .error
                    .unwrap_or_else(|| "handler failed without an error message".to_string());
                let failure = if report.outcome == AttemptOutcome::TimedOut {
                    OrchestratorError::Timeout {
                        job_id,
                        timeout_ms: self.store.get(&job_id)?.definition.timeout_ms,
                    }
                } else {
                    OrchestratorError::ExecutionFailure {
                        job_id,
                        attempt: report.attempt,
                        error: message.clone(),
                    }
                };

                let Some(job) =
                    self.transition(&job_id, JobState::Running, JobState::Failed, Some(message))?
                else {
                    return Ok(());
                };
                tracing::warn!(
                    job_id = %job_id,
                    attempt = job.attempts,
                    max_attempts = job.definition.max_attempts,
                    error = %failure,
                    "Attempt failed"
                );

                if failure.is_retryable() && job.attempts_remaining() {
                    self.schedule_retry(&job)?;
                } else if self
                    .transition(&job_id, JobState::Failed, JobState::Exhausted, None)?
                    .is_some()
                {
                    tracing::warn!(job_id = %job_id, attempts = job.attempts, "Job exhausted");
                    self.cancel_dependents(&job_id)?;
                }
            }
        }
        Ok(())
    }

    /// CAS with one re-read on conflict. `None` means another writer moved
    /// the job somewhere that makes this transition moot.
    fn transition(
        &self,
        job_id: &JobId,
        expected: JobState,
        new: JobState,
        error: Option<String>,
    ) -> Result<Option<Job>> {
        match self.store.update_state(job_id, expected, new, error.clone()) {
            Ok(job) => Ok(Some(job)),
            Err(OrchestratorError::Conflict { .. }) => {
                let current = self.store.state(job_id)?;
                if current != expected {
                    tracing::debug!(
                        job_id = %job_id,
                        expected = %expected,
                        actual = %current,
                        target = %new,
                        "Transition superseded"
                    );
                    return Ok(None);
                }
                match self.store.update_state(job_id, expected, new, error) {
                    Ok(job) => Ok(Some(job)),
                    Err(OrchestratorError::Conflict { actual, .. }) => {
                        tracing::warn!(job_id = %job_id, actual = %actual, target = %new, "Transition lost twice, giving up");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: &Job) -> Result<()> {
        let job_id = job.id;
        let delay = self.retry.delay_after_attempt(job.attempts);
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store.set_next_attempt(&job_id, Some(at))?;

        tracing::info!(
            job_id = %job_id,
            attempt = job.attempts,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );

        let this = self.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => {
                    tracing::debug!(job_id = %job_id, "Retry abandoned for shutdown");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            match this.transition(&job_id, JobState::Failed, JobState::Pending, None) {
                Ok(Some(job)) => {
                    if let Err(e) = this.admit(&job) {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to re-admit job for retry");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to move job back to pending");
                }
            }
        });
        Ok(())
    }

    /// Re-check a parked job and enqueue it if it became ready.
    fn recheck(&self, job_id: &JobId) -> Result<()> {
        let job = self.store.get(job_id)?;
        if job.state != JobState::Pending {
            self.deps.unpark(job_id);
            return Ok(());
        }
        match readiness(&self.store, &job) {
            Readiness::Ready => {
                if self.deps.unpark(job_id) {
                    tracing::debug!(job_id = %job_id, "Dependencies satisfied");
                    self.queue.enqueue(*job_id, job.definition.priority)?;
                }
            }
            Readiness::Waiting(_) => {}
            Readiness::Blocked { dependency, state } => {
                if self.deps.unpark(job_id) {
                    self.cancel_blocked(job_id, &dependency, state)?;
                }
            }
        }
        Ok(())
    }

    fn wake_dependents(&self, job_id: &JobId) -> Result<()> {
        for dependent in self.deps.take_dependents(job_id) {
            match self.recheck(&dependent) {
                Ok(()) | Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn cancel_blocked(
        &self,
        job_id: &JobId,
        dependency: &JobId,
        state: Option<JobState>,
    ) -> Result<()> {
        let reason = match state {
            Some(state) => format!("dependency {} ended {}", dependency, state),
            None => format!("dependency {} not found", dependency),
        };
        tracing::warn!(job_id = %job_id, dependency = %dependency, reason = %reason, "Cancelling job with failed dependency");
        if self
            .transition(job_id, JobState::Pending, JobState::Cancelled, Some(reason))?
            .is_some()
        {
            self.cancel_dependents(job_id)?;
        }
        Ok(())
    }

    /// Cancel every job parked (directly or transitively) on `root`.
    pub fn cancel_dependents(&self, root: &JobId) -> Result<()> {
        let mut stack = vec![*root];
        while let Some(id) = stack.pop() {
            for dependent in self.deps.take_dependents(&id) {
                if !self.deps.unpark(&dependent) {
                    continue;
                }
                let reason = format!("dependency {} did not succeed", id);
                match self.transition(&dependent, JobState::Pending, JobState::Cancelled, Some(reason)) {
                    Ok(Some(_)) => {
                        tracing::info!(job_id = %dependent, dependency = %id, "Dependent cancelled");
                        stack.push(dependent);
                    }
                    Ok(None) | Err(OrchestratorError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// User-initiated cancellation of a pending, running or retry-waiting job.
    ///
    /// Cancelling an already cancelled job succeeds without doing anything.
    pub fn cancel(&self, job_id: &JobId, reason: Option<String>) -> Result<Job> {
        let reason = reason.unwrap_or_else(|| "cancelled by request".to_string());
        // One re-read if a concurrent transition beats us.
        for _ in 0..2 {
            let job = self.store.get(job_id)?;
            match job.state {
                JobState::Cancelled => return Ok(job),
                JobState::Succeeded | JobState::Exhausted => {
                    return Err(OrchestratorError::Conflict {
                        job_id: *job_id,
                        expected: JobState::Running,
                        actual: job.state,
                    });
                }
                from @ (JobState::Pending | JobState::Running | JobState::Failed) => {
                    match self.store.update_state(
                        job_id,
                        from,
                        JobState::Cancelled,
                        Some(reason.clone()),
                    ) {
                        Ok(job) => {
                            tracing::info!(job_id = %job_id, from = %from, "Job cancelled");
                            if from == JobState::Running {
                                self.pool.cancel_job(job_id);
                            }
                            self.deps.unpark(job_id);
                            self.cancel_dependents(job_id)?;
                            return Ok(job);
                        }
                        Err(OrchestratorError::Conflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        let job = self.store.get(job_id)?;
        Err(OrchestratorError::Conflict {
            job_id: *job_id,
            expected: JobState::Running,
            actual: job.state,
        })
    }

    /// Bring jobs loaded from a snapshot back into the lifecycle.
    ///
    /// An attempt that was running when the snapshot was taken is recorded
    /// as interrupted. Failed jobs are retried if they have attempts left
    /// and exhausted otherwise. Pending jobs are re-admitted.
    pub fn recover(&self) -> Result<usize> {
        let mut admitted = 0;
        let jobs = self.store.list(&Default::default());
        for job in &jobs {
            if job.state == JobState::Running {
                let now = Utc::now();
                self.store.record_attempt(
                    &job.id,
                    Attempt {
                        number: job.attempts,
                        started_at: job.started_at.unwrap_or(now),
                        finished_at: now,
                        outcome: AttemptOutcome::Failed,
                        error: Some("interrupted".to_string()),
                        output: None,
                    },
                )?;
                self.store.update_state(
                    &job.id,
                    JobState::Running,
                    JobState::Failed,
                    Some("interrupted".to_string()),
                )?;
            }
        }

        for job in &jobs {
            let job = self.store.get(&job.id)?;
            if job.state == JobState::Failed {
                let next = if job.attempts_remaining() {
                    JobState::Pending
                } else {
                    JobState::Exhausted
                };
                self.store.update_state(&job.id, JobState::Failed, next, None)?;
            }
        }

        for job in &jobs {
            let job = self.store.get(&job.id)?;
            if job.state == JobState::Pending {
                self.admit(&job)?;
                admitted += 1;
            }
        }
        tracing::info!(jobs = jobs.len(), admitted, "Recovered job store");
        Ok(admitted)
    }
}
