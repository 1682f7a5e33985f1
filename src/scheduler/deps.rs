use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::scheduler::job::{Job, JobId, JobState};
use crate::scheduler::store::JobStore;

/// Result of checking a job's dependencies against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// At least one dependency has not succeeded yet.
    Waiting(Vec<JobId>),
    /// A dependency ended without succeeding, or no longer exists.
    Blocked { dependency: JobId, state: Option<JobState> },
}

/// Check every dependency of `job`.
pub fn readiness(store: &JobStore, job: &Job) -> Readiness {
    let mut waiting = Vec::new();
    for dep in &job.definition.dependencies {
        match store.state(dep) {
            Ok(JobState::Succeeded) => {}
            Ok(state) if state.is_terminal() => {
                return Readiness::Blocked {
                    dependency: *dep,
                    state: Some(state),
                }
            }
            Ok(_) => waiting.push(*dep),
            Err(_) => {
                return Readiness::Blocked {
                    dependency: *dep,
                    state: None,
                }
            }
        }
    }
    if waiting.is_empty() {
        Readiness::Ready
    } else {
        Readiness::Waiting(waiting)
    }
}

#[derive(Debug, Default)]
struct Index {
    /// dependency -> jobs parked on it
    dependents: HashMap<JobId, HashSet<JobId>>,
    /// jobs parked on at least one dependency
    parked: HashSet<JobId>,
}

/// Reverse-dependency index.
///
/// Jobs whose dependencies are not yet satisfied are parked here instead of
/// being re-enqueued. When a job finishes, the scheduler takes its dependents
/// and re-checks them. Only the caller that successfully unparks a job may
/// enqueue it, which keeps a parked job from being admitted twice.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    inner: Mutex<Index>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park `job_id` on each of `waiting_on`.
    pub fn park(&self, job_id: JobId, waiting_on: &[JobId]) {
        let mut index = self.lock();
        index.parked.insert(job_id);
        for dep in waiting_on {
            index.dependents.entry(*dep).or_default().insert(job_id);
        }
        tracing::debug!(job_id = %job_id, waiting_on = waiting_on.len(), "Job parked on dependencies");
    }

    /// Remove `job_id` from the parked set. Returns `true` for exactly one
    /// caller per park.
    pub fn unpark(&self, job_id: &JobId) -> bool {
        self.lock().parked.remove(job_id)
    }

    /// Take every job parked on `dependency`.
    pub fn take_dependents(&self, dependency: &JobId) -> Vec<JobId> {
        self.lock()
            .dependents
            .remove(dependency)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn is_parked(&self, job_id: &JobId) -> bool {
        self.lock().parked.contains(job_id)
    }

    pub fn parked_count(&self) -> usize {
        self.lock().parked.len()
    }
}
