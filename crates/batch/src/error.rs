//! Batch system errors.

use thiserror::Error;

/// Failure talking to a batch system.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The batch system refused the job or its reply was unreadable
    #[error("submission failed: {0}")]
    Submission(String),

    /// A state or accounting query failed
    #[error("query failed: {0}")]
    Query(String),

    /// An external command did not finish in time
    #[error("`{command}` timed out after {seconds}s")]
    Timeout {
        /// Program that was run
        command: String,
        /// Timeout that elapsed
        seconds: u64,
    },

    /// No batch system of this kind exists
    #[error("unknown scheduler: {0}")]
    UnknownScheduler(String),

    /// Filesystem or process failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
