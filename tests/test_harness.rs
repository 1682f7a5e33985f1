//! Test harness for orchestrator integration tests.
//!
//! Provides fast configs, instrumented handlers and polling helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use task_orchestrator::config::OrchestratorConfig;
use task_orchestrator::events::LifecycleEvent;
use task_orchestrator::scheduler::{Job, JobId, JobState, RetryPolicy};
use task_orchestrator::worker::{handler_fn, HandlerResult, JobContext, JobHandler};
use task_orchestrator::Orchestrator;
use tokio::sync::broadcast;

/// Config with short retry delays and grace period for faster tests
#[allow(dead_code)]
pub fn fast_config(capacity: usize) -> OrchestratorConfig {
    OrchestratorConfig::new(capacity)
        .with_retry(RetryPolicy::new(20, 200, 5))
        .with_shutdown_grace(Duration::from_millis(200))
}

/// Build and start an orchestrator
#[allow(dead_code)]
pub fn start(config: OrchestratorConfig, handler: Arc<dyn JobHandler>) -> Orchestrator {
    let orchestrator = Orchestrator::new(config, handler).unwrap();
    orchestrator.start().unwrap();
    orchestrator
}

/// Handler that sleeps for `delay` and then succeeds
#[allow(dead_code)]
pub fn succeed_after(delay: Duration) -> Arc<dyn JobHandler> {
    Arc::new(handler_fn(move |ctx: JobContext| async move {
        tokio::time::sleep(delay).await;
        Ok(Some(format!("done {}", ctx.attempt)))
    }))
}

/// Handler that always fails with `error`
#[allow(dead_code)]
pub fn always_fail(error: &'static str) -> Arc<dyn JobHandler> {
    Arc::new(handler_fn(move |_ctx: JobContext| async move {
        Err::<Option<String>, String>(error.to_string())
    }))
}

/// Handler that runs until it is cancelled
#[allow(dead_code)]
pub fn until_cancelled() -> Arc<dyn JobHandler> {
    Arc::new(handler_fn(|ctx: JobContext| async move {
        tokio::select! {
            _ = ctx.cancelled() => Err("cancelled".to_string()),
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(None),
        }
    }))
}

/// Tracks how many handlers run at once, overall and per job.
#[allow(dead_code)]
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
    per_job: Mutex<HashMap<JobId, usize>>,
    overlaps: AtomicUsize,
}

#[allow(dead_code)]
impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(&self, job_id: JobId) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        let mut per_job = self.per_job.lock().unwrap();
        let running = per_job.entry(job_id).or_insert(0);
        *running += 1;
        if *running > 1 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn exit(&self, job_id: JobId) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        if let Some(running) = self.per_job.lock().unwrap().get_mut(&job_id) {
            *running -= 1;
        }
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Times a job had more than one attempt running at once
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Handler that records concurrency and delegates to `result`
    pub fn handler<F>(self: &Arc<Self>, delay: Duration, result: F) -> Arc<dyn JobHandler>
    where
        F: Fn(&JobContext) -> HandlerResult + Send + Sync + 'static,
    {
        let gauge = self.clone();
        let result = Arc::new(result);
        Arc::new(handler_fn(move |ctx: JobContext| {
            let gauge = gauge.clone();
            let result = result.clone();
            async move {
                gauge.enter(ctx.job_id);
                tokio::time::sleep(delay).await;
                let outcome = (*result)(&ctx);
                gauge.exit(ctx.job_id);
                outcome
            }
        }))
    }
}

/// Poll the store until the job reaches `state`
#[allow(dead_code)]
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    job_id: &JobId,
    state: JobState,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = orchestrator.get(job_id).unwrap();
        if job.state == state {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "job {} stuck in {} waiting for {}",
                job_id, job.state, state
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until `check` holds for the job
#[allow(dead_code)]
pub async fn wait_for_job<F>(orchestrator: &Orchestrator, job_id: &JobId, timeout: Duration, check: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = orchestrator.get(job_id).unwrap();
        if check(&job) {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met for job {} (state {})", job_id, job.state);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain every event already buffered in the receiver
#[allow(dead_code)]
pub fn drain_events(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
