use chrono::{Duration as ChronoDuration, Utc};
use task_orchestrator::events::{EventBus, EventKind};
use task_orchestrator::scheduler::{
    Attempt, AttemptOutcome, Job, JobDefinition, JobFilter, JobState, JobStore,
};
use task_orchestrator::OrchestratorError;

fn new_store() -> JobStore {
    JobStore::new(EventBus::default())
}

fn stored_job(store: &JobStore, command: &str) -> Job {
    let job = Job::new(JobDefinition::new(command));
    store.put(job.clone()).unwrap();
    job
}

fn attempt(number: u32, outcome: AttemptOutcome) -> Attempt {
    let now = Utc::now();
    Attempt {
        number,
        started_at: now,
        finished_at: now,
        outcome,
        error: None,
        output: None,
    }
}

#[test]
fn test_put_and_get() {
    let store = new_store();
    let job = stored_job(&store, "echo hello");

    let fetched = store.get(&job.id).unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.state, JobState::Pending);
    assert_eq!(fetched.attempts, 0);
    assert_eq!(fetched.definition.command, "echo hello");
    assert_eq!(store.len(), 1);
}

#[test]
fn test_put_duplicate_rejected() {
    let store = new_store();
    let job = stored_job(&store, "echo");

    let result = store.put(job.clone());
    assert!(matches!(result, Err(OrchestratorError::AlreadyExists(id)) if id == job.id));
}

#[test]
fn test_get_unknown_job() {
    let store = new_store();
    let job = Job::new(JobDefinition::new("never stored"));
    assert!(matches!(
        store.get(&job.id),
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        store.update_state(&job.id, JobState::Pending, JobState::Running, None),
        Err(OrchestratorError::NotFound(_))
    ));
}

#[test]
fn test_update_state_is_compare_and_swap() {
    let store = new_store();
    let job = stored_job(&store, "cas");

    store
        .update_state(&job.id, JobState::Pending, JobState::Running, None)
        .unwrap();

    // Second claim loses: the job is no longer Pending
    let result = store.update_state(&job.id, JobState::Pending, JobState::Running, None);
    match result {
        Err(OrchestratorError::Conflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, JobState::Pending);
            assert_eq!(actual, JobState::Running);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert_eq!(store.get(&job.id).unwrap().attempts, 1);
}

#[test]
fn test_invalid_transition_rejected() {
    let store = new_store();
    let job = stored_job(&store, "skip");

    let result = store.update_state(&job.id, JobState::Pending, JobState::Succeeded, None);
    assert!(matches!(
        result,
        Err(OrchestratorError::InvalidTransition {
            from: JobState::Pending,
            to: JobState::Succeeded,
            ..
        })
    ));
    assert_eq!(store.state(&job.id).unwrap(), JobState::Pending);
}

#[test]
fn test_terminal_states_are_final() {
    let store = new_store();
    let job = stored_job(&store, "final");
    store
        .update_state(&job.id, JobState::Pending, JobState::Cancelled, None)
        .unwrap();

    for next in [JobState::Pending, JobState::Running, JobState::Failed] {
        assert!(matches!(
            store.update_state(&job.id, JobState::Cancelled, next, None),
            Err(OrchestratorError::InvalidTransition { .. })
        ));
    }
    assert!(store.get(&job.id).unwrap().finished_at.is_some());
}

#[test]
fn test_running_consumes_attempts_up_to_max() {
    let store = new_store();
    let job = Job::new(JobDefinition::new("twice").with_max_attempts(2));
    let id = job.id;
    store.put(job).unwrap();

    for _ in 0..2 {
        store
            .update_state(&id, JobState::Pending, JobState::Running, None)
            .unwrap();
        store
            .update_state(&id, JobState::Running, JobState::Failed, Some("err".into()))
            .unwrap();
        store
            .update_state(&id, JobState::Failed, JobState::Pending, None)
            .unwrap();
    }

    let result = store.update_state(&id, JobState::Pending, JobState::Running, None);
    assert!(matches!(
        result,
        Err(OrchestratorError::Exhausted { attempts: 2, .. })
    ));
    let job = store.get(&id).unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.last_error, Some("err".to_string()));
}

#[test]
fn test_transitions_publish_events_in_order() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let store = JobStore::new(events);

    let job = stored_job(&store, "events");
    store
        .update_state(&job.id, JobState::Pending, JobState::Running, None)
        .unwrap();
    store
        .update_state(&job.id, JobState::Running, JobState::Failed, Some("x".into()))
        .unwrap();
    store
        .update_state(&job.id, JobState::Failed, JobState::Pending, None)
        .unwrap();

    let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Submitted,
            EventKind::Started,
            EventKind::Failed,
            EventKind::Retried
        ]
    );
}

#[test]
fn test_failed_transition_publishes_nothing() {
    let events = EventBus::default();
    let store = JobStore::new(events.clone());
    let job = stored_job(&store, "quiet");

    let mut rx = events.subscribe();
    let _ = store.update_state(&job.id, JobState::Running, JobState::Succeeded, None);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_record_attempt_is_idempotent() {
    let store = new_store();
    let job = stored_job(&store, "attempts");
    store
        .update_state(&job.id, JobState::Pending, JobState::Running, None)
        .unwrap();

    assert!(store
        .record_attempt(&job.id, attempt(1, AttemptOutcome::Succeeded))
        .unwrap());
    assert!(!store
        .record_attempt(&job.id, attempt(1, AttemptOutcome::Failed))
        .unwrap());

    let history = store.get(&job.id).unwrap().history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, AttemptOutcome::Succeeded);

    // An attempt that never started cannot be recorded
    assert!(matches!(
        store.record_attempt(&job.id, attempt(2, AttemptOutcome::Failed)),
        Err(OrchestratorError::Internal(_))
    ));
}

#[test]
fn test_capacity_limit() {
    let store = JobStore::with_capacity(EventBus::default(), 2);
    stored_job(&store, "one");
    stored_job(&store, "two");
    assert!(store.is_full());

    let result = store.put(Job::new(JobDefinition::new("three")));
    assert!(matches!(result, Err(OrchestratorError::CapacityExceeded(2))));
}

#[test]
fn test_list_with_filters() {
    let store = new_store();
    let first = stored_job(&store, "first");
    let second = stored_job(&store, "second");
    store
        .update_state(&second.id, JobState::Pending, JobState::Cancelled, None)
        .unwrap();

    let all = store.list(&JobFilter::default());
    assert_eq!(all.len(), 2);
    assert!(all[0].submitted_at <= all[1].submitted_at);

    let pending = store.list(&JobFilter::with_state(JobState::Pending));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, first.id);

    let now = Utc::now();
    let window = JobFilter::between(now - ChronoDuration::hours(1), now + ChronoDuration::hours(1));
    assert_eq!(store.list(&window).len(), 2);
    let future = JobFilter::between(now + ChronoDuration::hours(1), now + ChronoDuration::hours(2));
    assert!(store.list(&future).is_empty());
}

#[test]
fn test_remove_and_purge() {
    let store = new_store();
    let active = stored_job(&store, "active");
    let done = stored_job(&store, "done");
    let also_done = stored_job(&store, "also done");
    for id in [done.id, also_done.id] {
        store
            .update_state(&id, JobState::Pending, JobState::Cancelled, None)
            .unwrap();
    }

    assert!(matches!(
        store.remove(&active.id),
        Err(OrchestratorError::Conflict { .. })
    ));
    assert_eq!(store.remove(&done.id).unwrap().id, done.id);
    assert!(matches!(
        store.remove(&done.id),
        Err(OrchestratorError::NotFound(_))
    ));

    assert_eq!(store.purge_finished(), 1);
    assert_eq!(store.len(), 1);
    assert!(store.get(&active.id).is_ok());
}

#[test]
fn test_finished_dependency_is_kept_while_dependent_is_pending() {
    let store = new_store();
    let upstream = stored_job(&store, "upstream");
    store
        .update_state(&upstream.id, JobState::Pending, JobState::Cancelled, None)
        .unwrap();
    let downstream = Job::new(JobDefinition::new("downstream").depends_on(upstream.id));
    store.put(downstream.clone()).unwrap();

    match store.remove(&upstream.id) {
        Err(OrchestratorError::DependencyInUse { job_id, dependent }) => {
            assert_eq!(job_id, upstream.id);
            assert_eq!(dependent, downstream.id);
        }
        other => panic!("expected DependencyInUse, got {:?}", other.map(|j| j.id)),
    }
    assert_eq!(store.purge_finished(), 0);
    assert_eq!(store.len(), 2);

    store
        .update_state(&downstream.id, JobState::Pending, JobState::Cancelled, None)
        .unwrap();
    assert_eq!(store.purge_finished(), 2);
    assert!(store.is_empty());
}

#[test]
fn test_save_and_load_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("jobs.json");

    let store = new_store();
    let job = stored_job(&store, "persisted");
    store
        .update_state(&job.id, JobState::Pending, JobState::Running, None)
        .unwrap();
    store
        .record_attempt(&job.id, attempt(1, AttemptOutcome::Succeeded))
        .unwrap();
    store
        .update_state(&job.id, JobState::Running, JobState::Succeeded, None)
        .unwrap();
    stored_job(&store, "waiting");
    store.save(&path).unwrap();

    let loaded = JobStore::load(&path, EventBus::default(), 100).unwrap();
    assert_eq!(loaded.len(), 2);
    let restored = loaded.get(&job.id).unwrap();
    assert_eq!(restored.state, JobState::Succeeded);
    assert_eq!(restored.attempts, 1);
    assert_eq!(restored.history.len(), 1);
    assert_eq!(
        restored.last_attempt().map(|a| a.outcome),
        Some(AttemptOutcome::Succeeded)
    );

    assert!(matches!(
        JobStore::load(&path, EventBus::default(), 1),
        Err(OrchestratorError::CapacityExceeded(1))
    ));
}

#[test]
fn test_load_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = JobStore::load(&dir.path().join("missing.json"), EventBus::default(), 10);
    assert!(matches!(result, Err(OrchestratorError::Io(_))));
}
