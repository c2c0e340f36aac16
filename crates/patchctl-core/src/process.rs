//! Subprocess execution under an explicit timeout and a cancellation token.
//!
//! Every external process patchctl starts (git, test commands, shell
//! operations) goes through [`run_command`], so none of them can block
//! indefinitely.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::cancel::CancellationToken;
use crate::error::{PatchError, Result};

/// A fully specified subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: &Path, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            timeout,
            env: Vec::new(),
        }
    }

    /// Run `command_line` through the platform shell (`sh -c` or `cmd /C`).
    pub fn shell(command_line: &str, cwd: &Path, timeout: Duration) -> Self {
        let (program, flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        Self::new(program, cwd, timeout).args([flag, command_line])
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line, used in logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

impl CommandOutput {
    /// stdout followed by stderr, trimmed and separated by a newline.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.trim_end().to_string();
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr);
        }
        combined
    }
}

/// Run a subprocess to completion.
///
/// Returns `Err(Timeout)` when `spec.timeout` elapses and `Err(Cancelled)`
/// when `cancel` fires first; the child is killed in both cases. A non-zero
/// exit is *not* an error here; callers decide what failure means.
pub async fn run_command(spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
    if cancel.is_cancelled() {
        return Err(PatchError::Cancelled(spec.display()));
    }

    let start = Instant::now();
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let child = command.spawn()?;

    let output = tokio::select! {
        res = tokio::time::timeout(spec.timeout, child.wait_with_output()) => {
            res.map_err(|_| PatchError::Timeout {
                what: spec.display(),
                limit_secs: spec.timeout.as_secs(),
            })??
        }
        _ = cancel.cancelled() => {
            return Err(PatchError::Cancelled(spec.display()));
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        success: output.status.success(),
    })
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_output(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let snippet: String = trimmed.chars().take(max).collect();
        format!("{}\n… (truncated)", snippet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_output_unicode_safe() {
        let input = "错误: 失败 😊";
        assert_eq!(truncate_output(input, 5), "错误: 失\n… (truncated)");
        assert_eq!(truncate_output("ok", 10), "ok");
    }

    #[test]
    fn combined_joins_streams() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "out\n".into(),
            stderr: "err\n".into(),
            duration_ms: 1,
            success: false,
        };
        assert_eq!(out.combined(), "out\nerr");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::shell("echo hello; exit 3", dir.path(), Duration::from_secs(10));
        let out = run_command(&spec, &CancellationToken::new()).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert!(out.stdout.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::shell("sleep 5", dir.path(), Duration::from_millis(100));
        let err = run_command(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::shell("sleep 5", dir.path(), Duration::from_secs(30));
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = run_command(&spec, &token).await.unwrap_err();
        assert!(matches!(err, PatchError::Cancelled(_)));
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new(
            "definitely-not-a-real-binary-xyz",
            dir.path(),
            Duration::from_secs(5),
        );
        let err = run_command(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Io(_)));
    }
}
