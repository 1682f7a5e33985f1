use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::scheduler::job::{Attempt, Job, JobId, JobState};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Query filter for [`JobStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn with_state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn between(after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        Self {
            submitted_after: Some(after),
            submitted_before: Some(before),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.state.map_or(true, |s| job.state == s)
            && self.submitted_after.map_or(true, |t| job.submitted_at >= t)
            && self.submitted_before.map_or(true, |t| job.submitted_at <= t)
    }
}

/// Durable record of every job and its lifecycle.
///
/// Each record sits behind its own mutex, so state updates for unrelated jobs
/// never contend. The outer index lock is only held long enough to find or
/// insert a record.
#[derive(Debug)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
    events: EventBus,
    max_jobs: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobStore {
    pub fn new(events: EventBus) -> Self {
        Self::with_capacity(events, DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(events: EventBus, max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            events,
            max_jobs,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn entry(&self, id: &JobId) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(*id))
    }

    /// Insert a new job. Publishes a `Submitted` event.
    pub fn put(&self, job: Job) -> Result<()> {
        let id = job.id;
        let event = LifecycleEvent::new(id, None, job.state, job.attempts, None);
        {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            if jobs.contains_key(&id) {
                return Err(OrchestratorError::AlreadyExists(id));
            }
            if jobs.len() >= self.max_jobs {
                return Err(OrchestratorError::CapacityExceeded(self.max_jobs));
            }
            jobs.insert(id, Arc::new(Mutex::new(job)));
        }
        tracing::debug!(job_id = %id, "Job stored");
        self.events.publish(event);
        Ok(())
    }

    pub fn get(&self, id: &JobId) -> Result<Job> {
        let entry = self.entry(id)?;
        let job = lock(&entry).clone();
        Ok(job)
    }

    pub fn state(&self, id: &JobId) -> Result<JobState> {
        let entry = self.entry(id)?;
        let state = lock(&entry).state;
        Ok(state)
    }

    /// Compare-and-swap the lifecycle state.
    ///
    /// Fails with `Conflict` when the current state is not `expected`, and
    /// with `InvalidTransition` when `expected -> new` is not a lifecycle
    /// edge. Moving to `Running` consumes one attempt and is refused once all
    /// attempts are used. On success the updated record is returned and a
    /// lifecycle event is published.
    pub fn update_state(
        &self,
        id: &JobId,
        expected: JobState,
        new: JobState,
        error: Option<String>,
    ) -> Result<Job> {
        let entry = self.entry(id)?;
        let mut job = lock(&entry);

        if job.state != expected {
            return Err(OrchestratorError::Conflict {
                job_id: *id,
                expected,
                actual: job.state,
            });
        }
        if !expected.can_transition_to(new) {
            return Err(OrchestratorError::InvalidTransition {
                job_id: *id,
                from: expected,
                to: new,
            });
        }

        let now = Utc::now();
        match new {
            JobState::Running => {
                if !job.attempts_remaining() {
                    return Err(OrchestratorError::Exhausted {
                        job_id: *id,
                        attempts: job.attempts,
                        last_error: job.last_error.clone(),
                    });
                }
                job.attempts += 1;
                job.started_at = Some(now);
                job.next_attempt_at = None;
            }
            JobState::Pending => {
                job.next_attempt_at = None;
            }
            JobState::Failed => {}
            JobState::Succeeded | JobState::Exhausted | JobState::Cancelled => {
                job.finished_at = Some(now);
                job.next_attempt_at = None;
            }
        }
        if error.is_some() {
            job.last_error = error.clone();
        }
        job.state = new;

        // Publish while the record is locked so per-job events stay ordered.
        self.events.publish(LifecycleEvent::new(
            *id,
            Some(expected),
            new,
            job.attempts,
            error,
        ));
        Ok(job.clone())
    }

    /// Append to the attempt history. Returns `false` when an attempt with
    /// the same number was already recorded.
    pub fn record_attempt(&self, id: &JobId, attempt: Attempt) -> Result<bool> {
        let entry = self.entry(id)?;
        let mut job = lock(&entry);
        if job.history.iter().any(|a| a.number == attempt.number) {
            return Ok(false);
        }
        if attempt.number == 0 || attempt.number > job.attempts {
            return Err(OrchestratorError::Internal(format!(
                "attempt {} recorded for job {} which has started {} attempts",
                attempt.number, id, job.attempts
            )));
        }
        job.history.push(attempt);
        Ok(true)
    }

    pub fn set_next_attempt(&self, id: &JobId, at: Option<DateTime<Utc>>) -> Result<()> {
        let entry = self.entry(id)?;
        lock(&entry).next_attempt_at = at;
        Ok(())
    }

    /// Jobs matching `filter`, oldest submission first.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let entries: Vec<Arc<Mutex<Job>>> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut jobs: Vec<Job> = entries
            .iter()
            .map(|entry| lock(entry).clone())
            .filter(|job| filter.matches(job))
            .collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Delete a terminal job. Fails with `DependencyInUse` while an unfinished
    /// job still lists it as a dependency.
    pub fn remove(&self, id: &JobId) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let entry = jobs.get(id).cloned().ok_or(OrchestratorError::NotFound(*id))?;
        let job = lock(&entry).clone();
        if !job.state.is_terminal() {
            return Err(OrchestratorError::Conflict {
                job_id: *id,
                expected: JobState::Succeeded,
                actual: job.state,
            });
        }
        if let Some(dependent) = referenced_by(&jobs).remove(id) {
            return Err(OrchestratorError::DependencyInUse {
                job_id: *id,
                dependent,
            });
        }
        jobs.remove(id);
        Ok(job)
    }

    /// Drop every terminal job that no unfinished job depends on. Returns the
    /// number of jobs removed.
    pub fn purge_finished(&self) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let referenced = referenced_by(&jobs);
        let before = jobs.len();
        jobs.retain(|id, entry| !lock(entry).state.is_terminal() || referenced.contains_key(id));
        let removed = before - jobs.len();
        tracing::debug!(removed, "Purged finished jobs");
        removed
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_jobs
    }

    /// Write every record, attempt history included, as a JSON array.
    pub fn save(&self, path: &Path) -> Result<()> {
        let jobs = self.list(&JobFilter::default());
        let data = serde_json::to_vec_pretty(&jobs)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), jobs = jobs.len(), "Job store saved");
        Ok(())
    }

    /// Read a snapshot written by [`JobStore::save`]. Records are restored as
    /// they were; no events are published.
    pub fn load(path: &Path, events: EventBus, max_jobs: usize) -> Result<Self> {
        let data = std::fs::read(path)?;
        let jobs: Vec<Job> = serde_json::from_slice(&data)?;
        if jobs.len() > max_jobs {
            return Err(OrchestratorError::CapacityExceeded(max_jobs));
        }
        let store = Self::with_capacity(events, max_jobs);
        {
            let mut map = store.jobs.write().unwrap_or_else(PoisonError::into_inner);
            for job in jobs {
                map.insert(job.id, Arc::new(Mutex::new(job)));
            }
        }
        tracing::info!(path = %path.display(), jobs = store.len(), "Job store loaded");
        Ok(store)
    }
}

/// Dependency id -> one unfinished job that lists it.
fn referenced_by(jobs: &HashMap<JobId, Arc<Mutex<Job>>>) -> HashMap<JobId, JobId> {
    let mut referenced = HashMap::new();
    for entry in jobs.values() {
        let job = lock(entry);
        if job.state.is_terminal() {
            continue;
        }
        for dep in &job.definition.dependencies {
            referenced.entry(*dep).or_insert(job.id);
        }
    }
    referenced
}
