use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::JobId;

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    job_id: JobId,
    priority: i32,
    seq: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    closed: bool,
}

/// Admission buffer between submission and dispatch.
///
/// Higher priority is dequeued first; equal priorities are FIFO by enqueue
/// order. `dequeue` suspends until an entry arrives or the queue is closed.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, job_id: JobId, priority: i32) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(OrchestratorError::QueueClosed);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueueEntry {
                job_id,
                priority,
                seq,
            });
        }
        tracing::debug!(job_id = %job_id, priority, "Job enqueued");
        self.notify.notify_one();
        Ok(())
    }

    /// Pop without waiting.
    pub fn try_dequeue(&self) -> Result<Option<JobId>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(OrchestratorError::QueueClosed);
        }
        Ok(inner.heap.pop().map(|e| e.job_id))
    }

    /// Wait for the next job id. Returns `QueueClosed` once [`close`](Self::close)
    /// has been called, even if entries remain.
    pub async fn dequeue(&self) -> Result<JobId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent enqueue cannot slip
            // between the check and the await.
            notified.as_mut().enable();

            if let Some(job_id) = self.try_dequeue()? {
                return Ok(job_id);
            }
            notified.await;
        }
    }

    /// Close the queue and wake every waiter.
    pub fn close(&self) {
        let remaining = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.heap.len()
        };
        tracing::debug!(remaining, "Job queue closed");
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }
}
