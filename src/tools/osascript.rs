//! AppleScript runner used by the iMessage sender and screen capture.

use std::time::Duration;

use crate::tools::shell::{ShellError, run_program};

/// Default AppleScript timeout.
pub const OSASCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// AppleScript failures.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error(transparent)]
    Process(#[from] ShellError),

    #[error("{0}")]
    Script(String),
}

/// Escape text for a double-quoted AppleScript string literal.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\\r");
            }
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Run a script through `osascript -e`. Any stderr output counts as failure.
pub async fn run(script: &str, timeout: Duration) -> Result<String, ScriptError> {
    let output = run_program("osascript", &["-e", script], timeout).await?;
    let stderr = output.stderr.trim();
    if output.exit_code != 0 || !stderr.is_empty() {
        let detail: String = if stderr.is_empty() {
            format!("osascript exited with status {}", output.exit_code)
        } else {
            stderr.chars().take(200).collect()
        };
        return Err(ScriptError::Script(detail));
    }
    Ok(output.stdout.trim().to_string())
}
