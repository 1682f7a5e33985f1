pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
