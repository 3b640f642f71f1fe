//! Execution layer - jobs, tasks and the workflow loop.

#![warn(missing_docs)]

pub mod error;
pub mod job;
pub mod log;
pub mod task;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{WorkflowError, WorkflowResult};
pub use job::{Job, JobState, LOST_EXIT_STATUS, MAX_MISSING_RECORDS};
pub use log::CycleLog;
pub use task::{RunContext, Task};
pub use orchestrator::{CycleStatus, CycleSummary, EngineConfig, Orchestrator, TaskSummary};
