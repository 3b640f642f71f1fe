//! Running external scheduler commands under a hard timeout.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::BatchError;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, -1 when killed by a signal
    pub exit_code: i32,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `program args...` and wait at most `timeout` for it.
///
/// The child is killed when the timeout elapses.
pub async fn run_command(
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<CommandOutput, BatchError> {
    debug!(program, ?args, "running scheduler command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| BatchError::Timeout {
            command: program.to_string(),
            seconds: timeout.as_secs(),
        })??;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let out = run_command(
            "sh",
            &["-c".to_string(), "echo \"$GREETING\"; exit 3".to_string()],
            &BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let result = run_command(
            "sleep",
            &["5".to_string()],
            &BTreeMap::new(),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(BatchError::Timeout { .. })));
    }
}
