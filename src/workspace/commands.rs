//! Subprocess execution bounded by a per-call timeout.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

/// Exit code reported when a command exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to wait for pipe readers to drain after a timed-out kill.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// `$ cmd` header followed by both streams, as written to step logs.
    pub fn transcript(&self, cmd: &str) -> String {
        format!("$ {}\n\n{}\n{}", cmd, self.stdout, self.stderr)
    }
}

/// Runs commands with the sandbox as working directory.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    cwd: PathBuf,
}

impl CommandRunner {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Run a shell snippet through `bash -lc`.
    pub async fn run_shell(&self, cmd: &str, limit: Duration) -> Result<CommandResult> {
        self.run("bash", &["-lc", cmd], limit).await
    }

    /// Run a program with arguments. A timeout is not an error: it yields
    /// exit code 124 with whatever output was produced so far.
    pub async fn run(&self, program: &str, args: &[&str], limit: Duration) -> Result<CommandResult> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn `{}` in {}", program, self.cwd.display()))?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(drain(pipe, stdout_buf.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain(pipe, stderr_buf.clone())));

        let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for command")?;
                (status.code().unwrap_or(-1), false)
            }
            Err(_) => {
                tracing::warn!(program, timeout_secs = limit.as_secs(), "command timed out");
                kill_process_group(child.id());
                let _ = child.kill().await;
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            if timed_out {
                let _ = timeout(DRAIN_GRACE, task).await;
            } else {
                let _ = task.await;
            }
        }

        let stdout = take_lossy(&stdout_buf);
        let mut stderr = take_lossy(&stderr_buf);
        if timed_out {
            stderr.push_str(&format!("\n[timeout] command exceeded {}s", limit.as_secs()));
        }

        Ok(CommandResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut guard) = buf.lock() {
                    guard.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

fn take_lossy(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    buf.lock()
        .map(|guard| String::from_utf8_lossy(&guard).into_owned())
        .unwrap_or_default()
}

/// Kill the whole process group so grandchildren of `bash -lc` release
/// the output pipes.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = std::process::Command::new("kill")
            .args(["-KILL", "--", &format!("-{}", pid)])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_shell_captures_streams_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new(dir.path());
        let res = runner
            .run_shell("echo out; echo err >&2; exit 3", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(res.exit_code, 3);
        assert!(res.stdout.contains("out"));
        assert!(res.stderr.contains("err"));
        assert!(!res.stdout.contains("err"));
        assert!(!res.timed_out);
        assert!(!res.success());
    }

    #[tokio::test]
    async fn test_run_shell_uses_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let runner = CommandRunner::new(dir.path());
        let res = runner
            .run_shell("cat marker.txt", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(res.success());
        assert_eq!(res.stdout.trim(), "here");
    }

    #[tokio::test]
    async fn test_timeout_reports_124_with_partial_output() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new(dir.path());
        let res = runner
            .run_shell("echo started; sleep 30; echo never", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(res.exit_code, TIMEOUT_EXIT_CODE);
        assert!(res.timed_out);
        assert!(res.stdout.contains("started"));
        assert!(!res.stdout.contains("never"));
        assert!(res.stderr.contains("[timeout] command exceeded 3s"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_127() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new(dir.path());
        let res = runner
            .run_shell("definitely-not-a-real-tool-xyz", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(res.exit_code, 127);
        assert!(res.stderr.to_lowercase().contains("not found"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new(dir.path().join("missing-dir"));
        let result = runner.run("echo", &["hi"], Duration::from_secs(5)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_transcript_format() {
        let res = CommandResult {
            exit_code: 0,
            stdout: "ok".into(),
            stderr: String::new(),
            timed_out: false,
        };
        assert_eq!(res.transcript("pytest"), "$ pytest\n\nok\n");
    }
}
