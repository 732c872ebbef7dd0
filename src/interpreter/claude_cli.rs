//! Interpreter backed by the `claude` command-line tool in print mode.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Interpreter, InterpreterRequest};
use crate::error::InterpreterError;

/// Maximum stderr carried into a failure message.
const MAX_STDERR_CHARS: usize = 500;

/// Runs `claude -p <prompt> --output-format json`.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    program: String,
    working_dir: Option<PathBuf>,
}

impl ClaudeCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            working_dir: None,
        }
    }

    /// Set the directory the interpreter runs in.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn build_command(&self, request: &InterpreterRequest<'_>) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("-p").arg(request.prompt);
        if !request.allowed_capabilities.is_empty() {
            command
                .arg("--allowedTools")
                .arg(request.allowed_capabilities.join(","));
        }
        command.args(["--output-format", "json"]);
        if let Some(system) = request.system_instruction {
            command.arg("--system-prompt").arg(system);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Interpreter for ClaudeCli {
    fn name(&self) -> &str {
        "Claude Code"
    }

    async fn invoke(&self, request: InterpreterRequest<'_>) -> Result<String, InterpreterError> {
        info!(
            prompt = %truncate_chars(request.prompt, 80),
            timeout_secs = request.timeout.as_secs(),
            "Invoking interpreter"
        );

        let child = self.build_command(&request).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InterpreterError::NotFound {
                    program: self.program.clone(),
                }
            } else {
                InterpreterError::Io(e)
            }
        })?;

        // Dropping the future on timeout kills the child (kill_on_drop).
        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_secs = request.timeout.as_secs(), "Interpreter timed out");
                return Err(InterpreterError::Timeout {
                    timeout: request.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            code = ?output.status.code(),
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Interpreter finished"
        );

        if !output.status.success() {
            return Err(InterpreterError::Failed {
                code: output.status.code(),
                stderr: truncate_chars(stderr.trim(), MAX_STDERR_CHARS),
            });
        }

        let text = parse_output(stdout.trim());
        if text.trim().is_empty() {
            return Err(InterpreterError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Extract the reply from `--output-format json`.
///
/// Prefers the `result` field, then concatenated `content` text blocks,
/// and falls back to the raw output when it is not JSON.
pub(crate) fn parse_output(raw: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return raw.to_string();
    };
    let Some(obj) = value.as_object() else {
        return match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
    };

    if let Some(result) = obj.get("result") {
        return match result {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
    }

    match obj.get("content") {
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => raw.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
