use crate::error::{Result, ToolError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const OUTPUT_BYTES_MAX: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

pub fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C");
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c");
        cmd
    };
    cmd.arg(command);
    cmd
}

/// Runs `cmd` to completion. The child is killed when the timeout elapses.
///
/// A non-zero exit status is a normal result; only spawn failures and timeouts are errors.
pub async fn run_process(
    mut cmd: Command,
    working_directory: &Path,
    timeout: Duration,
) -> Result<ProcessOutput> {
    cmd.current_dir(working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            ToolError::Timeout(format!("process exceeded {} seconds", timeout.as_secs()))
        })?
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn process: {e}")))?;

    let returncode = output.status.code().unwrap_or(-1);
    if returncode != 0 {
        tracing::warn!(returncode, "process exited with non-zero status");
    }
    Ok(ProcessOutput {
        stdout: truncate_utf8(String::from_utf8_lossy(&output.stdout).into_owned(), OUTPUT_BYTES_MAX),
        stderr: truncate_utf8(String::from_utf8_lossy(&output.stderr).into_owned(), OUTPUT_BYTES_MAX),
        returncode,
        file: None,
    })
}

/// Truncates to at most `max_bytes`, backing off to the previous char boundary.
pub fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_process(shell_command("echo hello && pwd"), dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.returncode, 0);
        assert!(out.stdout.contains("hello"));
        let name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(out.stdout.contains(&name));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_result() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_process(shell_command("echo oops >&2; exit 3"), dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.returncode, 3);
        assert!(out.stderr.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_process_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_process(shell_command("sleep 5"), dir.path(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "request_timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_process(
            shell_command("head -c 20000 /dev/zero | tr '\\0' 'a'"),
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.len(), OUTPUT_BYTES_MAX);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(10);
        let cut = truncate_utf8(text, 5);
        assert_eq!(cut, "éé");
        assert_eq!(truncate_utf8("short".to_string(), 100), "short");
    }
}
