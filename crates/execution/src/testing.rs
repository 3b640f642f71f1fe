//! Scripted in-memory batch system for tests.

use async_trait::async_trait;
use chrono::{Duration as Span, Utc};
use cyclewm_batch::{BatchError, BatchJobState, BatchSystem, ExitRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Script {
    next_id: u32,
    submissions: Vec<(String, String)>,
    environments: HashMap<String, BTreeMap<String, String>>,
    states: HashMap<String, BatchJobState>,
    records: HashMap<String, ExitRecord>,
    cancelled: Vec<String>,
    fail_submissions: bool,
    fail_queries: bool,
}

/// Batch system whose jobs only change state when a test says so.
#[derive(Default)]
pub(crate) struct ScriptedBatch {
    script: Mutex<Script>,
}

impl ScriptedBatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut script = self.script.lock().unwrap();
        f(&mut script)
    }

    pub fn set_state(&self, job_id: &str, state: BatchJobState) {
        self.with(|s| s.states.insert(job_id.to_string(), state));
    }

    /// Finish a job with `status` and a ten minute runtime.
    pub fn finish(&self, job_id: &str, status: i32) {
        let end = Utc::now();
        self.with(|s| {
            s.states.insert(job_id.to_string(), BatchJobState::Done);
            s.records.insert(
                job_id.to_string(),
                ExitRecord {
                    exit_status: status,
                    start_time: end - Span::minutes(10),
                    end_time: end,
                },
            );
        });
    }

    pub fn finish_without_record(&self, job_id: &str) {
        self.with(|s| {
            s.states.insert(job_id.to_string(), BatchJobState::Done);
            s.records.remove(job_id);
        });
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.with(|s| s.fail_submissions = fail);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.with(|s| s.fail_queries = fail);
    }

    /// `(job id, command)` of every accepted submission, in order.
    pub fn submissions(&self) -> Vec<(String, String)> {
        self.with(|s| s.submissions.clone())
    }

    /// Job ids whose command was `command`.
    pub fn jobs_for(&self, command: &str) -> Vec<String> {
        self.with(|s| {
            s.submissions
                .iter()
                .filter(|(_, c)| c == command)
                .map(|(id, _)| id.clone())
                .collect()
        })
    }

    pub fn environment(&self, job_id: &str) -> BTreeMap<String, String> {
        self.with(|s| s.environments.get(job_id).cloned().unwrap_or_default())
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.with(|s| s.cancelled.clone())
    }
}

#[async_trait]
impl BatchSystem for ScriptedBatch {
    fn kind(&self) -> &str {
        "scripted"
    }

    async fn submit(
        &self,
        command: &str,
        _attributes: &BTreeMap<String, String>,
        environment: &BTreeMap<String, String>,
    ) -> Result<String, BatchError> {
        self.with(|s| {
            if s.fail_submissions {
                return Err(BatchError::Submission("queue closed".to_string()));
            }
            s.next_id += 1;
            let id = s.next_id.to_string();
            s.submissions.push((id.clone(), command.to_string()));
            s.environments.insert(id.clone(), environment.clone());
            s.states.insert(id.clone(), BatchJobState::Queued);
            Ok(id)
        })
    }

    async fn get_job_state(&self, job_id: &str) -> Result<BatchJobState, BatchError> {
        self.with(|s| {
            if s.fail_queries {
                return Err(BatchError::Query("scheduler unreachable".to_string()));
            }
            Ok(s.states.get(job_id).copied().unwrap_or(BatchJobState::Unknown))
        })
    }

    async fn get_job_exit_record(&self, job_id: &str) -> Result<Option<ExitRecord>, BatchError> {
        self.with(|s| {
            if s.fail_queries {
                return Err(BatchError::Query("scheduler unreachable".to_string()));
            }
            Ok(s.records.get(job_id).cloned())
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BatchError> {
        self.with(|s| {
            s.cancelled.push(job_id.to_string());
            s.states.insert(job_id.to_string(), BatchJobState::Done);
        });
        Ok(())
    }

    async fn describe(&self) -> Result<String, BatchError> {
        Ok(self.with(|s| format!("{} jobs", s.submissions.len())))
    }
}
