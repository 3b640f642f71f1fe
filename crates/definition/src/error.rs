//! Definition errors. Every variant is a configuration error.

use cyclewm_core::{ScheduleError, TemplateError};
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for definition loading.
pub type DefinitionResult<T> = Result<T, DefinitionError>;

/// A workflow definition that cannot be loaded.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The definition file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Not valid YAML, or not the expected shape
    #[error("invalid definition: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A schedule's fields do not parse
    #[error("schedule '{id}': {source}")]
    Schedule {
        /// Schedule id
        id: String,
        /// Underlying error
        source: ScheduleError,
    },

    /// A cycle string template does not parse
    #[error("task '{task}': {source}")]
    Template {
        /// Task the template belongs to
        task: String,
        /// Underlying error
        source: TemplateError,
    },

    /// Two schedules or two tasks share an id
    #[error("duplicate {kind} id '{id}'")]
    DuplicateId {
        /// "task" or "schedule"
        kind: &'static str,
        /// Offending id
        id: String,
    },

    /// Something refers to an undefined schedule, task or scheduler
    #[error("{from} refers to unknown {kind} '{id}'")]
    UnknownReference {
        /// "task", "schedule" or "scheduler"
        kind: &'static str,
        /// Missing id
        id: String,
        /// Where the reference appears
        from: String,
    },

    /// Any other semantic violation
    #[error("invalid definition: {0}")]
    Invalid(String),
}
