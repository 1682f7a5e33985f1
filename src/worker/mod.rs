//! Job execution.
//!
//! - **Pool**: a fixed number of slots, each running at most one attempt
//! - **Handlers**: what an attempt actually does
//!
//! # Components
//!
//! - [`WorkerPool`]: reserves slots, launches attempts, cancels and reclaims them
//! - [`JobHandler`]: trait implemented by anything that can run a job
//! - [`ShellExecutor`]: runs the job's command through `sh -c`, optionally in Docker
//! - [`handler_fn`]: wraps an async closure as a handler
//!
//! # Execution Flow
//!
//! 1. The scheduler reserves a slot with [`WorkerPool::reserve`]
//! 2. [`SlotReservation::launch`](pool::SlotReservation::launch) spawns the handler
//! 3. The handler returns output or an error, or stops early once cancelled
//! 4. The slot sends one [`AttemptReport`](pool::AttemptReport) and becomes idle

pub mod executor;
pub mod pool;

pub use executor::{handler_fn, FnHandler, HandlerResult, JobContext, JobHandler, ShellExecutor};
pub use pool::{AttemptReport, SlotHandle, SlotReservation, SlotState, SlotStatus, WorkerPool};
