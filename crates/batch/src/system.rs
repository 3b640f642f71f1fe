//! Batch system abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::BatchError;

/// An external job scheduler that runs submitted commands.
#[async_trait]
pub trait BatchSystem: Send + Sync {
    /// Scheduler kind, as named in workflow definitions.
    fn kind(&self) -> &str;

    /// Submit a command and return the external job id.
    async fn submit(
        &self,
        command: &str,
        attributes: &BTreeMap<String, String>,
        environment: &BTreeMap<String, String>,
    ) -> Result<String, BatchError>;

    /// Current state of a job. Implementations answer from a cached
    /// poll table rather than querying once per call.
    async fn get_job_state(&self, job_id: &str) -> Result<BatchJobState, BatchError>;

    /// Accounting record of a finished job, `None` while it cannot be found.
    async fn get_job_exit_record(&self, job_id: &str) -> Result<Option<ExitRecord>, BatchError>;

    /// Cancel a job.
    async fn cancel(&self, job_id: &str) -> Result<(), BatchError>;

    /// Human-readable queue dump for crash reports.
    async fn describe(&self) -> Result<String, BatchError>;
}

/// Job state as reported by a batch system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobState {
    /// Waiting in the queue
    Queued,
    /// Executing
    Running,
    /// Between states, e.g. completing or requeueing
    Transitioning,
    /// The batch system flagged the job as failed outright
    Error,
    /// No longer in the queue
    Done,
    /// State could not be determined
    Unknown,
}

/// Exit status and timing of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    /// Exit status; signals map to 128 + signal
    pub exit_status: i32,

    /// When the job started running
    pub start_time: DateTime<Utc>,

    /// When the job finished
    pub end_time: DateTime<Utc>,
}

impl ExitRecord {
    /// Wall-clock execution time in seconds.
    pub fn runtime_secs(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds().max(0)
    }
}
