//! cyclewm core data model.
//!
//! This crate defines the pure, side-effect free building blocks of the
//! cyclic workflow manager: cycles, cron-like schedules, per-cycle string
//! templates, dependency trees and task definitions.

#![warn(missing_docs)]

// Time model
mod cycle;
mod schedule;
mod template;

// Task model
mod dependency;
mod task;

mod error;

// Re-exports
pub use cycle::{Cycle, ParseCycleError};
pub use schedule::{step_cycles, CycleSchedule, FieldSet};
pub use template::CycleString;
pub use dependency::{
    DependencyNode, EvalContext, FilePredicate, TaskCondition, TaskLookup, TaskPredicate,
    TimePredicate,
};
pub use task::TaskDefinition;
pub use error::{ScheduleError, TemplateError};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
