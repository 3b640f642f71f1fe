//! Job - one submission of a task for one cycle.

use cyclewm_batch::{BatchError, BatchJobState, BatchSystem};
use cyclewm_core::Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Consecutive polls without an exit record tolerated for a finished job.
pub const MAX_MISSING_RECORDS: u32 = 3;

/// Exit status assumed for a job whose exit record never showed up.
pub const LOST_EXIT_STATUS: i32 = 255;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created or submitted, not polled yet
    #[default]
    New,
    /// Waiting in the batch queue
    Queued,
    /// Executing
    Running,
    /// Between batch states
    Transitioning,
    /// Flagged as failed by the batch system, or never accepted
    Error,
    /// State could not be determined on the last poll
    Unknown,
    /// Finished
    Done,
}

impl From<BatchJobState> for JobState {
    fn from(state: BatchJobState) -> Self {
        match state {
            BatchJobState::Queued => JobState::Queued,
            BatchJobState::Running => JobState::Running,
            BatchJobState::Transitioning => JobState::Transitioning,
            BatchJobState::Error => JobState::Error,
            BatchJobState::Done => JobState::Done,
            BatchJobState::Unknown => JobState::Unknown,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::New => "new",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Transitioning => "transitioning",
            JobState::Error => "error",
            JobState::Unknown => "unknown",
            JobState::Done => "done",
        };
        f.write_str(name)
    }
}

/// One attempt at running a task for a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    id: Option<String>,
    state: JobState,
    exit_status: Option<i32>,
    runtime_secs: Option<i64>,
    #[serde(default)]
    missing_records: u32,
}

/// Bound a batch system call, turning an elapsed timeout into an error.
async fn bounded<T>(
    timeout: Duration,
    call: &str,
    fut: impl Future<Output = Result<T, BatchError>>,
) -> Result<T, BatchError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| BatchError::Timeout {
            command: call.to_string(),
            seconds: timeout.as_secs(),
        })?
}

impl Job {
    /// A job that has not been submitted.
    pub fn new() -> Self {
        Self::default()
    }

    /// A job the batch system refused. It counts as crashed.
    pub fn rejected() -> Self {
        Self {
            state: JobState::Error,
            ..Self::default()
        }
    }

    /// External job id, once submitted.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Exit status, once known.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Execution time in seconds, once known.
    pub fn runtime_secs(&self) -> Option<i64> {
        self.runtime_secs
    }

    /// Submit the job.
    pub async fn submit(
        &mut self,
        batch: &dyn BatchSystem,
        command: &str,
        attributes: &BTreeMap<String, String>,
        environment: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<(), BatchError> {
        let id = bounded(timeout, "submit", batch.submit(command, attributes, environment)).await?;
        self.id = Some(id);
        self.state = JobState::New;
        Ok(())
    }

    /// Poll the batch system.
    ///
    /// Returns `Ok(true)` when this poll moved the job into a done state.
    /// A failed query leaves the job `Unknown` and returns the error.
    pub async fn update_state(
        &mut self,
        batch: &dyn BatchSystem,
        timeout: Duration,
    ) -> Result<bool, BatchError> {
        let Some(id) = self.id.clone() else {
            return Ok(false);
        };
        if self.exit_status.is_some() {
            return Ok(false);
        }
        let was_done = self.done();

        let state = match bounded(timeout, "get_job_state", batch.get_job_state(&id)).await {
            Ok(state) => JobState::from(state),
            Err(e) => {
                self.state = JobState::Unknown;
                return Err(e);
            }
        };
        if state != JobState::Done {
            self.state = state;
            return Ok(!was_done && self.done());
        }

        let record = match bounded(timeout, "get_job_exit_record", batch.get_job_exit_record(&id))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.state = JobState::Unknown;
                return Err(e);
            }
        };

        match record {
            Some(record) => {
                if self.missing_records > 1 {
                    warn!(
                        job_id = %id,
                        polls = self.missing_records,
                        "exit record found after repeated misses"
                    );
                }
                self.missing_records = 0;
                self.exit_status = Some(record.exit_status);
                self.runtime_secs = Some(record.runtime_secs());
                self.state = JobState::Done;
            }
            None => {
                self.missing_records += 1;
                if self.missing_records > MAX_MISSING_RECORDS {
                    warn!(
                        job_id = %id,
                        "no exit record after {} polls, assuming exit status {}",
                        self.missing_records, LOST_EXIT_STATUS
                    );
                    self.exit_status = Some(LOST_EXIT_STATUS);
                    self.state = JobState::Done;
                } else {
                    debug!(job_id = %id, polls = self.missing_records, "exit record not found yet");
                    self.state = JobState::Unknown;
                }
            }
        }

        Ok(!was_done && self.done())
    }

    /// Cancel the job. Failures are logged, not returned.
    pub async fn cancel(&self, batch: &dyn BatchSystem, timeout: Duration) {
        let Some(id) = self.id.as_deref() else {
            return;
        };
        if let Err(e) = bounded(timeout, "cancel", batch.cancel(id)).await {
            warn!(job_id = %id, "failed to cancel job: {}", e);
        }
    }

    /// Give up on a live job: mark it finished with the lost-job status.
    ///
    /// Returns whether the job was still in flight.
    pub fn abandon(&mut self) -> bool {
        let was_done = self.done();
        self.state = JobState::Done;
        self.exit_status.get_or_insert(LOST_EXIT_STATUS);
        !was_done
    }

    /// Submitted and not done yet.
    pub fn in_flight(&self) -> bool {
        self.id.is_some() && !self.done()
    }

    /// Running or transitioning.
    pub fn running(&self) -> bool {
        matches!(self.state, JobState::Running | JobState::Transitioning)
    }

    /// Waiting in the queue.
    pub fn waiting(&self) -> bool {
        self.state == JobState::Queued
    }

    /// Flagged as failed by the batch system.
    pub fn error_state(&self) -> bool {
        self.state == JobState::Error
    }

    /// Finished, one way or another.
    pub fn done(&self) -> bool {
        self.state == JobState::Done || self.error_state()
    }

    /// Finished with exit status 0.
    pub fn done_okay(&self) -> bool {
        self.state == JobState::Done && self.exit_status == Some(0)
    }

    /// Finished with a non-zero status, or failed outright.
    pub fn crashed(&self) -> bool {
        (self.state == JobState::Done && self.exit_status.is_some_and(|s| s != 0))
            || self.error_state()
    }

    /// Whether the job missed its start or end deadline at `now`.
    pub fn expired(&self, start_deadline: Option<Time>, end_deadline: Option<Time>, now: Time) -> bool {
        let late_start = start_deadline.is_some_and(|deadline| now > deadline)
            && !self.running()
            && !self.done_okay()
            && self.state != JobState::Unknown;
        let late_end = end_deadline.is_some_and(|deadline| now > deadline) && !self.done_okay();
        late_start || late_end
    }
}
