//! SLURM batch system.
//!
//! Submits with `sbatch --parsable`, answers state queries from a poll
//! table refreshed from `squeue` at most once per refresh interval, and
//! reads exit records from `sacct`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::command::run_command;
use crate::error::BatchError;
use crate::system::{BatchJobState, BatchSystem, ExitRecord};

#[derive(Default)]
struct PollTable {
    refreshed: Option<Instant>,
    states: HashMap<String, BatchJobState>,
}

/// SLURM adapter.
pub struct SlurmBatch {
    timeout: Duration,
    refresh: Duration,
    table: Mutex<PollTable>,
}

impl SlurmBatch {
    /// Create an adapter with a command timeout and poll refresh interval.
    pub fn new(timeout: Duration, refresh: Duration) -> Self {
        Self {
            timeout,
            refresh,
            table: Mutex::new(PollTable::default()),
        }
    }

    async fn refresh_table(&self, table: &mut PollTable) -> Result<(), BatchError> {
        let out = run_command(
            "squeue",
            &["-h".to_string(), "-o".to_string(), "%i %T".to_string()],
            &BTreeMap::new(),
            self.timeout,
        )
        .await?;
        if !out.success() {
            return Err(BatchError::Query(format!("squeue failed: {}", out.stderr.trim())));
        }

        table.states = parse_squeue(&out.stdout);
        table.refreshed = Some(Instant::now());
        debug!(jobs = table.states.len(), "refreshed slurm poll table");
        Ok(())
    }
}

/// Translate `sbatch` submit options from job attributes.
fn submit_args(command: &str, attributes: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = vec!["--parsable".to_string()];
    let joined = attributes.get("join");

    for (name, value) in attributes {
        let arg = match name.as_str() {
            "join" => format!("--output={value}"),
            "stdout" if joined.is_none() => format!("--output={value}"),
            "stderr" if joined.is_none() => format!("--error={value}"),
            "stdout" | "stderr" => continue,
            "jobname" => format!("--job-name={value}"),
            "queue" => format!("--partition={value}"),
            "walltime" => format!("--time={value}"),
            other => format!("--{other}={value}"),
        };
        args.push(arg);
    }

    args.push(format!("--wrap={command}"));
    args
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
fn parse_job_id(stdout: &str) -> Option<String> {
    let id = stdout.trim().split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')).then(|| id.to_string())
}

fn parse_squeue(stdout: &str) -> HashMap<String, BatchJobState> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let state = parts.next()?;
            Some((id.to_string(), map_state(state)))
        })
        .collect()
}

fn map_state(state: &str) -> BatchJobState {
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "SUSPENDED" => {
            BatchJobState::Queued
        }
        "RUNNING" => BatchJobState::Running,
        "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => BatchJobState::Transitioning,
        "BOOT_FAIL" | "NODE_FAIL" => BatchJobState::Error,
        "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "DEADLINE" => BatchJobState::Done,
        _ => BatchJobState::Unknown,
    }
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

/// Parse `sacct -n -P -X -o JobID,State,ExitCode,Start,End`.
fn parse_sacct(stdout: &str, job_id: &str) -> Option<ExitRecord> {
    stdout.lines().find_map(|line| {
        let fields: Vec<&str> = line.split('|').collect();
        let [id, state, exit_code, start, end] = fields.as_slice() else {
            return None;
        };
        if *id != job_id || matches!(*state, "PENDING" | "RUNNING" | "REQUEUED") {
            return None;
        }

        let (code, signal) = exit_code.split_once(':')?;
        let code: i32 = code.parse().ok()?;
        let signal: i32 = signal.parse().ok()?;
        let status = if signal > 0 { 128 + signal } else { code };

        Some(ExitRecord {
            exit_status: status,
            start_time: parse_time(start)?,
            end_time: parse_time(end)?,
        })
    })
}

#[async_trait]
impl BatchSystem for SlurmBatch {
    fn kind(&self) -> &str {
        "slurm"
    }

    async fn submit(
        &self,
        command: &str,
        attributes: &BTreeMap<String, String>,
        environment: &BTreeMap<String, String>,
    ) -> Result<String, BatchError> {
        let out = run_command("sbatch", &submit_args(command, attributes), environment, self.timeout)
            .await?;
        if !out.success() {
            return Err(BatchError::Submission(format!(
                "sbatch exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        let job_id = parse_job_id(&out.stdout).ok_or_else(|| {
            BatchError::Submission(format!("unexpected sbatch output: {:?}", out.stdout))
        })?;

        // Not in squeue until the next refresh
        self.table
            .lock()
            .await
            .states
            .insert(job_id.clone(), BatchJobState::Queued);

        info!(job_id = %job_id, "submitted slurm job");
        Ok(job_id)
    }

    async fn get_job_state(&self, job_id: &str) -> Result<BatchJobState, BatchError> {
        let mut table = self.table.lock().await;
        let stale = table
            .refreshed
            .map_or(true, |at| at.elapsed() >= self.refresh);
        if stale {
            self.refresh_table(&mut table).await?;
        }
        // Jobs drop out of squeue once they finish
        Ok(table
            .states
            .get(job_id)
            .copied()
            .unwrap_or(BatchJobState::Done))
    }

    async fn get_job_exit_record(&self, job_id: &str) -> Result<Option<ExitRecord>, BatchError> {
        let args = [
            "-n",
            "-P",
            "-X",
            "-j",
            job_id,
            "-o",
            "JobID,State,ExitCode,Start,End",
        ]
        .map(String::from);
        let out = run_command("sacct", &args, &BTreeMap::new(), self.timeout).await?;
        if !out.success() {
            return Err(BatchError::Query(format!("sacct failed: {}", out.stderr.trim())));
        }
        Ok(parse_sacct(&out.stdout, job_id))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BatchError> {
        let out = run_command("scancel", &[job_id.to_string()], &BTreeMap::new(), self.timeout)
            .await?;
        if !out.success() {
            return Err(BatchError::Query(format!(
                "scancel {job_id} failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn describe(&self) -> Result<String, BatchError> {
        let out = run_command("squeue", &[], &BTreeMap::new(), self.timeout).await?;
        Ok(out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_args() {
        let attrs = BTreeMap::from([
            ("stdout".to_string(), "/logs/a.out".to_string()),
            ("stderr".to_string(), "/logs/a.err".to_string()),
            ("account".to_string(), "ops".to_string()),
            ("queue".to_string(), "batch".to_string()),
        ]);
        let args = submit_args("/bin/run.sh", &attrs);
        assert_eq!(args[0], "--parsable");
        assert!(args.contains(&"--output=/logs/a.out".to_string()));
        assert!(args.contains(&"--error=/logs/a.err".to_string()));
        assert!(args.contains(&"--account=ops".to_string()));
        assert!(args.contains(&"--partition=batch".to_string()));
        assert_eq!(args.last().unwrap(), "--wrap=/bin/run.sh");
    }

    #[test]
    fn test_join_overrides_stdout_and_stderr() {
        let attrs = BTreeMap::from([
            ("join".to_string(), "/logs/a.log".to_string()),
            ("stdout".to_string(), "/logs/a.out".to_string()),
            ("stderr".to_string(), "/logs/a.err".to_string()),
        ]);
        let args = submit_args("true", &attrs);
        assert_eq!(args, vec!["--parsable", "--output=/logs/a.log", "--wrap=true"]);
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("12345\n").as_deref(), Some("12345"));
        assert_eq!(parse_job_id("12345;cluster\n").as_deref(), Some("12345"));
        assert_eq!(parse_job_id("sbatch: error\n"), None);
    }

    #[test]
    fn test_parse_squeue() {
        let table = parse_squeue("101 PENDING\n102 RUNNING\n103 COMPLETING\n104 NODE_FAIL\n");
        assert_eq!(table["101"], BatchJobState::Queued);
        assert_eq!(table["102"], BatchJobState::Running);
        assert_eq!(table["103"], BatchJobState::Transitioning);
        assert_eq!(table["104"], BatchJobState::Error);
    }

    #[test]
    fn test_parse_sacct() {
        let out = "101|COMPLETED|0:0|2024-01-01T00:00:00|2024-01-01T00:10:00\n";
        let record = parse_sacct(out, "101").unwrap();
        assert_eq!(record.exit_status, 0);
        assert_eq!(record.runtime_secs(), 600);

        let out = "102|CANCELLED|0:15|2024-01-01T00:00:00|2024-01-01T00:01:00\n";
        assert_eq!(parse_sacct(out, "102").unwrap().exit_status, 143);

        let out = "103|RUNNING|0:0|2024-01-01T00:00:00|Unknown\n";
        assert!(parse_sacct(out, "103").is_none());
        assert!(parse_sacct("", "104").is_none());
    }
}
