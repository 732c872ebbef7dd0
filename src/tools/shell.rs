//! Shell passthrough for `!` commands.
//!
//! Provides controlled command execution with:
//! - Working directory isolation
//! - Timeout enforcement (the child is killed when the timeout fires)
//! - Output capture and UTF-8 safe truncation

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shell execution failures that never produced an exit status.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellOutput {
    /// `[exit code: N]` (non-zero only), stdout, then `[stderr]` and its text.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if self.exit_code != 0 {
            parts.push(format!("[exit code: {}]", self.exit_code));
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            parts.push(stdout.to_string());
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            parts.push(format!("[stderr]\n{stderr}"));
        }
        if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        }
    }
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    /// Working directory for commands (if None, uses cwd).
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a command, capturing stdout and stderr.
    pub async fn run(&self, cmd: &str) -> Result<ShellOutput, ShellError> {
        info!(command = %truncate_for_log(cmd), "Shell exec");

        let mut command = Command::new("sh");
        command
            .args(["-c", cmd])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        collect(command, self.timeout).await
    }
}

/// Run `program` with `args` directly (no shell), bounded by `timeout`.
pub async fn run_program(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<ShellOutput, ShellError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    collect(command, timeout).await
}

async fn collect(mut command: Command, timeout: Duration) -> Result<ShellOutput, ShellError> {
    let child = command.spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            let output = result?;
            Ok(ShellOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            })
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Command timed out");
            Err(ShellError::Timeout(timeout))
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncate to at most `max` bytes on a char boundary, marking the cut.
pub fn truncate_output(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let end = floor_char_boundary(s, max);
    format!("{}\n... [truncated {} bytes]", &s[..end], s.len() - end)
}

/// Find the largest byte index <= `i` that is a valid char boundary.
pub fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Truncate command for log lines.
fn truncate_for_log(s: &str) -> String {
    if s.chars().count() <= 120 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(120).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_command() {
        let output = ShellRunner::new().run("echo hello").await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.render(), "hello");
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let output = ShellRunner::new()
            .run("echo out; echo oops >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.render(), "[exit code: 3]\nout\n[stderr]\noops");
    }

    #[tokio::test]
    async fn test_no_output() {
        let output = ShellRunner::new().run("true").await.unwrap();
        assert_eq!(output.render(), "(no output)");
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let runner = ShellRunner::new().with_timeout(Duration::from_millis(100));
        let result = runner.run("sleep 10").await;
        assert!(matches!(result, Err(ShellError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new().with_working_dir(dir.path().to_path_buf());
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let output = runner.run("ls").await.unwrap();
        assert!(output.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_run_program_skips_shell() {
        let out = run_program("echo", &["$HOME", "a b"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "$HOME a b\n");

        let missing = run_program("definitely-not-a-program-xyz", &[], Duration::from_secs(5)).await;
        assert!(matches!(missing, Err(ShellError::Spawn(_))));
    }

    #[test]
    fn test_truncate_output_utf8_safe() {
        let s = "héllo wörld";
        let out = truncate_output(s, 2);
        assert!(out.starts_with('h'));
        assert!(out.contains("[truncated"));
        assert_eq!(truncate_output("short", 100), "short");
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "aé";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 10), s.len());
    }
}
