//! Lifecycle event bus.
//!
//! Every successful state change in the [`JobStore`](crate::scheduler::JobStore)
//! publishes a [`LifecycleEvent`]. Consumers either hold a raw broadcast
//! receiver from [`EventBus::subscribe`] or a `Stream` from
//! [`EventBus::stream`].
//!
//! Delivery is at-least-once from the consumer's point of view: a consumer
//! that lags behind the channel capacity sees `Lagged` and should re-read the
//! store. Consumers must be idempotent on `(job_id, from, to, attempt)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::scheduler::job::{JobId, JobState};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Submitted,
    Started,
    Succeeded,
    Failed,
    Retried,
    Exhausted,
    Cancelled,
}

impl EventKind {
    /// Classify a transition. `from` is `None` for a fresh submission.
    pub fn for_transition(from: Option<JobState>, to: JobState) -> Self {
        match (from, to) {
            (None, _) => EventKind::Submitted,
            (Some(JobState::Failed), JobState::Pending) => EventKind::Retried,
            (Some(_), JobState::Pending) => EventKind::Submitted,
            (Some(_), JobState::Running) => EventKind::Started,
            (Some(_), JobState::Succeeded) => EventKind::Succeeded,
            (Some(_), JobState::Failed) => EventKind::Failed,
            (Some(_), JobState::Exhausted) => EventKind::Exhausted,
            (Some(_), JobState::Cancelled) => EventKind::Cancelled,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Submitted => "submitted",
            EventKind::Started => "started",
            EventKind::Succeeded => "succeeded",
            EventKind::Failed => "failed",
            EventKind::Retried => "retried",
            EventKind::Exhausted => "exhausted",
            EventKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    pub kind: EventKind,
    pub from: Option<JobState>,
    pub to: JobState,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

impl LifecycleEvent {
    pub fn new(
        job_id: JobId,
        from: Option<JobState>,
        to: JobState,
        attempt: u32,
        error: Option<String>,
    ) -> Self {
        Self {
            job_id,
            kind: EventKind::for_transition(from, to),
            from,
            to,
            attempt,
            at: Utc::now(),
            error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) {
        tracing::debug!(
            job_id = %event.job_id,
            kind = %event.kind,
            to = %event.to,
            attempt = event.attempt,
            "Lifecycle event"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Event stream that skips over lag notifications.
    pub fn stream(&self) -> impl Stream<Item = LifecycleEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "Event subscriber lagged");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
