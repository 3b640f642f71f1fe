//! Workflow definition source for cyclewm.
//!
//! Definitions are YAML documents with named schedules and an ordered task
//! list. Metatasks are expanded before parsing, and every reference is
//! checked, so a loaded [`WorkflowDefinition`] is ready for execution.

#![warn(missing_docs)]

mod document;
mod error;
mod metatask;
mod workflow;

pub use error::{DefinitionError, DefinitionResult};
pub use workflow::{WorkflowDefinition, DEFAULT_ADMISSION_STEP};
