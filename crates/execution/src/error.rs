//! Workflow errors.

use cyclewm_batch::BatchError;
use cyclewm_definition::DefinitionError;
use cyclewm_storage::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for orchestrator operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The definition could not be loaded
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// A batch system could not be set up
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Reading or writing the store failed
    #[error(transparent)]
    Store(StoreError),

    /// Another orchestrator holds the store
    #[error("workflow is locked: {0} is in use by another process")]
    Locked(PathBuf),

    /// The store of a retrospective workflow cannot be read
    #[error(
        "store {path} is corrupt ({source}). Its cycle history cannot be rebuilt \
         automatically: restore it from a backup, or delete it to replay the \
         workflow from the beginning"
    )]
    Corrupt {
        /// Store location
        path: PathBuf,
        /// Parse failure
        source: serde_json::Error,
    },
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Locked(path) => WorkflowError::Locked(path),
            StoreError::Corrupt { path, source } => WorkflowError::Corrupt { path, source },
            other => WorkflowError::Store(other),
        }
    }
}
