pub mod backoff;
pub mod deps;
pub mod engine;
pub mod job;
pub mod queue;
pub mod store;

pub use backoff::RetryPolicy;
pub use deps::DependencyIndex;
pub use engine::Scheduler;
pub use job::{Attempt, AttemptOutcome, Job, JobDefinition, JobId, JobState};
pub use queue::JobQueue;
pub use store::{JobFilter, JobStore};
