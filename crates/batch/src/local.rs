//! Local batch system: runs jobs as detached processes on this host.
//!
//! Every job leaves two files in the spool directory: `<id>.pid` holding
//! the wrapper pid and submit time, and `<id>.exit` holding
//! `<status> <start> <end>` once the command finished. All state is on
//! disk, so jobs survive orchestrator restarts.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::command::run_command;
use crate::error::BatchError;
use crate::system::{BatchJobState, BatchSystem, ExitRecord};

const WRAPPER: &str = r#"start=$(date +%s)
sh -c "$CYCLEWM_COMMAND"
rc=$?
end=$(date +%s)
echo "$rc $start $end" > "$CYCLEWM_EXIT_FILE.tmp" && mv "$CYCLEWM_EXIT_FILE.tmp" "$CYCLEWM_EXIT_FILE"
"#;

/// Exit status recorded for a cancelled job (128 + SIGTERM).
const CANCELLED_STATUS: i32 = 143;

/// Detached-process batch system.
pub struct LocalBatch {
    spool: PathBuf,
    timeout: Duration,
}

impl LocalBatch {
    /// Create a local batch system keeping its files under `spool`.
    pub fn new(spool: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            spool: spool.into(),
            timeout,
        }
    }

    fn pid_path(&self, job_id: &str) -> PathBuf {
        self.spool.join(format!("{job_id}.pid"))
    }

    fn exit_path(&self, job_id: &str) -> PathBuf {
        self.spool.join(format!("{job_id}.exit"))
    }

    async fn read_pid(&self, job_id: &str) -> Result<(u32, i64), BatchError> {
        let text = match tokio::fs::read_to_string(self.pid_path(job_id)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BatchError::Query(format!("no such job: {job_id}")))
            }
            Err(e) => return Err(e.into()),
        };

        let mut parts = text.split_whitespace();
        let pid = parts.next().and_then(|p| p.parse().ok());
        let submitted = parts.next().and_then(|s| s.parse().ok());
        match (pid, submitted) {
            (Some(pid), Some(submitted)) => Ok((pid, submitted)),
            _ => Err(BatchError::Query(format!("bad pid file for {job_id}"))),
        }
    }

    async fn alive(&self, pid: u32) -> bool {
        let proc = Path::new("/proc");
        if proc.is_dir() {
            return proc.join(pid.to_string()).exists();
        }
        run_command("kill", &["-0".to_string(), pid.to_string()], &BTreeMap::new(), self.timeout)
            .await
            .map(|out| out.success())
            .unwrap_or(false)
    }

    async fn write_exit(&self, job_id: &str, record: &ExitRecord) -> Result<(), BatchError> {
        let path = self.exit_path(job_id);
        let tmp = path.with_extension("exit.tmp");
        let line = format!(
            "{} {} {}\n",
            record.exit_status,
            record.start_time.timestamp(),
            record.end_time.timestamp()
        );
        tokio::fs::write(&tmp, line).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn open_output(path: &str) -> Result<Stdio, BatchError> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Stdio::from(file))
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn parse_exit(text: &str) -> Option<ExitRecord> {
    let fields: Vec<i64> = text
        .split_whitespace()
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    match fields.as_slice() {
        [status, start, end] => Some(ExitRecord {
            exit_status: i32::try_from(*status).ok()?,
            start_time: timestamp(*start)?,
            end_time: timestamp(*end)?,
        }),
        _ => None,
    }
}

#[async_trait]
impl BatchSystem for LocalBatch {
    fn kind(&self) -> &str {
        "local"
    }

    async fn submit(
        &self,
        command: &str,
        attributes: &BTreeMap<String, String>,
        environment: &BTreeMap<String, String>,
    ) -> Result<String, BatchError> {
        tokio::fs::create_dir_all(&self.spool).await?;
        let job_id = Ulid::new().to_string();

        let (stdout, stderr) = match attributes.get("join") {
            Some(join) => (open_output(join)?, open_output(join)?),
            None => (
                attributes
                    .get("stdout")
                    .map(|p| open_output(p))
                    .transpose()?
                    .unwrap_or_else(Stdio::null),
                attributes
                    .get("stderr")
                    .map(|p| open_output(p))
                    .transpose()?
                    .unwrap_or_else(Stdio::null),
            ),
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(WRAPPER)
            .envs(environment)
            .env("CYCLEWM_COMMAND", command)
            .env("CYCLEWM_EXIT_FILE", self.exit_path(&job_id))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| BatchError::Submission(format!("failed to spawn: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| BatchError::Submission("failed to get process ID".to_string()))?;
        // Reap the wrapper so it does not linger as a zombie
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        tokio::fs::write(
            self.pid_path(&job_id),
            format!("{pid} {}\n", Utc::now().timestamp()),
        )
        .await?;

        info!(job_id = %job_id, pid, "submitted local job");
        Ok(job_id)
    }

    async fn get_job_state(&self, job_id: &str) -> Result<BatchJobState, BatchError> {
        if tokio::fs::try_exists(self.exit_path(job_id)).await? {
            return Ok(BatchJobState::Done);
        }
        let (pid, _) = self.read_pid(job_id).await?;
        if self.alive(pid).await {
            Ok(BatchJobState::Running)
        } else {
            Ok(BatchJobState::Done)
        }
    }

    async fn get_job_exit_record(&self, job_id: &str) -> Result<Option<ExitRecord>, BatchError> {
        let text = match tokio::fs::read_to_string(self.exit_path(job_id)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse_exit(&text)
            .map(Some)
            .ok_or_else(|| BatchError::Query(format!("bad exit record for {job_id}: {text:?}")))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BatchError> {
        let (pid, submitted) = self.read_pid(job_id).await?;
        if tokio::fs::try_exists(self.exit_path(job_id)).await? {
            debug!(job_id, "job already finished, nothing to cancel");
            return Ok(());
        }

        let out = run_command(
            "kill",
            &["-TERM".to_string(), format!("-{pid}")],
            &BTreeMap::new(),
            self.timeout,
        )
        .await?;
        if !out.success() && self.alive(pid).await {
            return Err(BatchError::Query(format!(
                "kill {pid} failed: {}",
                out.stderr.trim()
            )));
        }

        let now = Utc::now();
        let record = ExitRecord {
            exit_status: CANCELLED_STATUS,
            start_time: timestamp(submitted).unwrap_or(now),
            end_time: now,
        };
        if let Err(e) = self.write_exit(job_id, &record).await {
            warn!(job_id, "failed to record cancellation: {}", e);
        }
        Ok(())
    }

    async fn describe(&self) -> Result<String, BatchError> {
        let mut lines = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.spool).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(job_id) = name.strip_suffix(".pid") else {
                continue;
            };
            let state = match self.get_job_exit_record(job_id).await {
                Ok(Some(record)) => format!("done status={}", record.exit_status),
                _ => match self.read_pid(job_id).await {
                    Ok((pid, _)) if self.alive(pid).await => format!("running pid={pid}"),
                    Ok((pid, _)) => format!("vanished pid={pid}"),
                    Err(e) => e.to_string(),
                },
            };
            lines.push(format!("{job_id} {state}"));
        }

        lines.sort();
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(dir: &TempDir) -> LocalBatch {
        LocalBatch::new(dir.path().join("spool"), Duration::from_secs(10))
    }

    async fn wait_for_record(batch: &LocalBatch, job_id: &str) -> ExitRecord {
        for _ in 0..100 {
            if let Some(record) = batch.get_job_exit_record(job_id).await.unwrap() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never finished");
    }

    #[tokio::test]
    async fn test_submit_runs_command_with_environment() {
        let dir = TempDir::new().unwrap();
        let batch = batch(&dir);
        let out = dir.path().join("logs/job.out");

        let job_id = batch
            .submit(
                "echo \"$CDATE\"",
                &BTreeMap::from([("stdout".to_string(), out.display().to_string())]),
                &BTreeMap::from([("CDATE".to_string(), "2024010106".to_string())]),
            )
            .await
            .unwrap();

        let record = wait_for_record(&batch, &job_id).await;
        assert_eq!(record.exit_status, 0);
        assert_eq!(batch.get_job_state(&job_id).await.unwrap(), BatchJobState::Done);
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "2024010106");
    }

    #[tokio::test]
    async fn test_exit_status_is_recorded() {
        let dir = TempDir::new().unwrap();
        let batch = batch(&dir);

        let job_id = batch
            .submit("exit 3", &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(wait_for_record(&batch, &job_id).await.exit_status, 3);
    }

    #[tokio::test]
    async fn test_cancel_records_termination() {
        let dir = TempDir::new().unwrap();
        let batch = batch(&dir);

        let job_id = batch
            .submit("sleep 30", &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(batch.get_job_state(&job_id).await.unwrap(), BatchJobState::Running);

        batch.cancel(&job_id).await.unwrap();
        let record = batch.get_job_exit_record(&job_id).await.unwrap().unwrap();
        assert_eq!(record.exit_status, CANCELLED_STATUS);
        assert!(batch.describe().await.unwrap().contains(&job_id));
    }

    #[tokio::test]
    async fn test_unknown_job_is_query_error() {
        let dir = TempDir::new().unwrap();
        let batch = batch(&dir);

        assert!(matches!(
            batch.get_job_state("nope").await,
            Err(BatchError::Query(_))
        ));
        assert!(batch.get_job_exit_record("nope").await.unwrap().is_none());
    }

    #[test]
    fn test_parse_exit() {
        let record = parse_exit("0 1704067200 1704067260\n").unwrap();
        assert_eq!(record.exit_status, 0);
        assert_eq!(record.runtime_secs(), 60);
        assert!(parse_exit("garbage").is_none());
    }
}
