use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::{AttemptOutcome, Job, JobId};
use crate::worker::executor::{JobContext, JobHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Reserved,
    Busy { job_id: JobId, attempt: u32 },
}

#[derive(Debug)]
struct WorkerSlot {
    state: SlotState,
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
}

impl WorkerSlot {
    fn idle() -> Self {
        Self {
            state: SlotState::Idle,
            cancel: CancellationToken::new(),
            abort: None,
        }
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub index: usize,
    pub state: SlotState,
    pub cancelled: bool,
}

/// The single report a slot sends for each attempt it runs.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub job_id: JobId,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Shared {
    slots: Vec<Mutex<WorkerSlot>>,
    idle: Notify,
}

impl Shared {
    fn slot(&self, index: usize) -> MutexGuard<'_, WorkerSlot> {
        self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, index: usize) {
        {
            let mut slot = self.slot(index);
            slot.state = SlotState::Idle;
            slot.abort = None;
        }
        self.idle.notify_waiters();
    }
}

/// Frees the slot when the attempt's task ends, whether it returned,
/// panicked or was aborted. The permit is released after the slot is marked
/// idle, so whoever acquires it next always finds a free slot.
struct SlotGuard {
    shared: Arc<Shared>,
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.release(self.index);
    }
}

/// A slot held for a job that has not been launched yet. Dropping it without
/// launching returns the slot to the pool.
pub struct SlotReservation {
    shared: Arc<Shared>,
    index: usize,
    permit: Option<OwnedSemaphorePermit>,
    handler: Arc<dyn JobHandler>,
}

impl SlotReservation {
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Run the handler for the job's current attempt in this slot.
    pub fn launch(mut self, job: &Job) -> Result<SlotHandle> {
        let permit = self.permit.take().ok_or_else(|| {
            OrchestratorError::Internal(format!("slot {} launched twice", self.index))
        })?;

        let job_id = job.id;
        let attempt = job.attempts;
        let cancel = CancellationToken::new();
        let ctx = JobContext::new(
            job_id,
            job.definition.name.clone(),
            job.definition.command.clone(),
            job.definition.payload.clone(),
            attempt,
            cancel.clone(),
        );

        {
            let mut slot = self.shared.slot(self.index);
            slot.state = SlotState::Busy { job_id, attempt };
            slot.cancel = cancel.clone();
        }

        let guard = SlotGuard {
            shared: self.shared.clone(),
            index: self.index,
            _permit: permit,
        };
        let handler = self.handler.clone();
        let task_cancel = cancel.clone();
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let started_at = Utc::now();
            let result = handler.run(ctx).await;
            let finished_at = Utc::now();

            let (outcome, output, error) = match result {
                Ok(output) => (AttemptOutcome::Succeeded, output, None),
                Err(e) if task_cancel.is_cancelled() => (AttemptOutcome::Cancelled, None, Some(e)),
                Err(e) => (AttemptOutcome::Failed, None, Some(e)),
            };
            let _ = tx.send(AttemptReport {
                job_id,
                attempt,
                outcome,
                output,
                error,
                started_at,
                finished_at,
            });
        });
        let abort = task.abort_handle();

        {
            let mut slot = self.shared.slot(self.index);
            if slot.state == (SlotState::Busy { job_id, attempt }) {
                slot.abort = Some(abort.clone());
            }
        }

        tracing::debug!(job_id = %job_id, attempt, slot = self.index, "Attempt launched");
        Ok(SlotHandle {
            job_id,
            attempt,
            slot: self.index,
            cancel,
            abort,
            report: rx,
        })
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.shared.release(self.index);
            drop(permit);
        }
    }
}

/// Handle to one running attempt.
#[derive(Debug)]
pub struct SlotHandle {
    pub job_id: JobId,
    pub attempt: u32,
    pub slot: usize,
    cancel: CancellationToken,
    abort: AbortHandle,
    report: oneshot::Receiver<AttemptReport>,
}

impl SlotHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the slot's report. `None` means the task ended without
    /// reporting (panic or forced reclamation).
    pub async fn report(&mut self) -> Option<AttemptReport> {
        (&mut self.report).await.ok()
    }
}

/// Fixed set of execution slots.
///
/// At most `capacity` handlers run at any instant. A slot is reserved before
/// its job is claimed, so a job only becomes `Running` once it actually has
/// somewhere to run.
pub struct WorkerPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    shared: Arc<Shared>,
    handler: Arc<dyn JobHandler>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("busy", &self.busy())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(capacity: usize, handler: Arc<dyn JobHandler>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            shared: Arc::new(Shared {
                slots: (0..capacity).map(|_| Mutex::new(WorkerSlot::idle())).collect(),
                idle: Notify::new(),
            }),
            handler,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free slot and hold it.
    pub async fn reserve(&self) -> Result<SlotReservation> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::ShuttingDown)?;

        for index in 0..self.capacity {
            let mut slot = self.shared.slot(index);
            if slot.state == SlotState::Idle {
                slot.state = SlotState::Reserved;
                return Ok(SlotReservation {
                    shared: self.shared.clone(),
                    index,
                    permit: Some(permit),
                    handler: self.handler.clone(),
                });
            }
        }
        Err(OrchestratorError::Internal(
            "semaphore permit acquired but no idle slot".to_string(),
        ))
    }

    /// Reserve a slot and launch the job in it.
    pub async fn submit(&self, job: &Job) -> Result<SlotHandle> {
        self.reserve().await?.launch(job)
    }

    /// Ask the handler to stop at its next checkpoint.
    pub fn cancel(&self, handle: &SlotHandle) {
        tracing::debug!(job_id = %handle.job_id, slot = handle.slot, "Slot cancellation requested");
        handle.cancel.cancel();
    }

    /// Cancel whichever slot is running `job_id`. Returns whether one was found.
    pub fn cancel_job(&self, job_id: &JobId) -> bool {
        for index in 0..self.capacity {
            let slot = self.shared.slot(index);
            if let SlotState::Busy { job_id: running, .. } = slot.state {
                if running == *job_id {
                    slot.cancel.cancel();
                    tracing::debug!(job_id = %job_id, slot = index, "Slot cancellation requested");
                    return true;
                }
            }
        }
        false
    }

    /// Abort the attempt's task and free its slot.
    pub fn reclaim(&self, handle: &SlotHandle) {
        tracing::warn!(job_id = %handle.job_id, slot = handle.slot, "Reclaiming slot");
        handle.abort.abort();
    }

    pub fn cancel_all(&self) {
        for index in 0..self.capacity {
            let slot = self.shared.slot(index);
            if matches!(slot.state, SlotState::Busy { .. }) {
                slot.cancel.cancel();
            }
        }
    }

    /// Abort every running attempt. Returns how many were aborted.
    pub fn reclaim_all(&self) -> usize {
        let mut aborted = 0;
        for index in 0..self.capacity {
            let slot = self.shared.slot(index);
            if let Some(abort) = &slot.abort {
                abort.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "Reclaimed busy slots");
        }
        aborted
    }

    /// Refuse further reservations. Pending `reserve` calls fail.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Slots that are reserved or running.
    pub fn busy(&self) -> usize {
        (0..self.capacity)
            .filter(|&i| self.shared.slot(i).state != SlotState::Idle)
            .count()
    }

    pub fn slots(&self) -> Vec<SlotStatus> {
        (0..self.capacity)
            .map(|index| {
                let slot = self.shared.slot(index);
                SlotStatus {
                    index,
                    state: slot.state,
                    cancelled: slot.cancel.is_cancelled(),
                }
            })
            .collect()
    }

    /// Resolves once every slot is idle.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.busy() == 0 {
                return;
            }
            notified.await;
        }
    }
}
