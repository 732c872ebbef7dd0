//! Command executor: status, shell passthrough, natural language.
//!
//! Every path returns text. Failures below this boundary are rendered as
//! `❌ …` strings so the dispatcher always has something to deliver.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::agent::prompts;
use crate::agent::stats::AgentStats;
use crate::error::InterpreterError;
use crate::identity::Identity;
use crate::interpreter::{Interpreter, InterpreterRequest};
use crate::safety::{BLOCK_RESPONSE, DeletionGuard};
use crate::tools::shell::{ShellError, ShellRunner, truncate_output};

/// Marker that routes the rest of a command straight to the shell.
pub const SHELL_MARKER: char = '!';

/// Which path a command takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind<'a> {
    Status,
    Shell(&'a str),
    Natural(&'a str),
}

/// Classify a trimmed command.
pub fn classify(command: &str) -> CommandKind<'_> {
    let command = command.trim();
    if command.eq_ignore_ascii_case("status") {
        CommandKind::Status
    } else if let Some(rest) = command.strip_prefix(SHELL_MARKER) {
        CommandKind::Shell(rest.trim())
    } else {
        CommandKind::Natural(command)
    }
}

/// Executor limits.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub interpreter_timeout: Duration,
    pub max_response_length: usize,
    pub allowed_tools: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter_timeout: Duration::from_secs(300),
            max_response_length: 4500,
            allowed_tools: ["Bash", "Read", "Write", "Edit", "MultiEdit"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Shared command executor used by both channels.
pub struct CommandExecutor {
    interpreter: Arc<dyn Interpreter>,
    shell: ShellRunner,
    guard: DeletionGuard,
    stats: Arc<AgentStats>,
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(
        interpreter: Arc<dyn Interpreter>,
        shell: ShellRunner,
        guard: DeletionGuard,
        stats: Arc<AgentStats>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            interpreter,
            shell,
            guard,
            stats,
            config,
        }
    }

    pub fn guard(&self) -> &DeletionGuard {
        &self.guard
    }

    pub async fn execute(&self, command: &str, identity: &Identity, context_prefix: &str) -> String {
        self.execute_at(command, identity, context_prefix, Utc::now())
            .await
    }

    /// Classify and run one command.
    pub async fn execute_at(
        &self,
        command: &str,
        identity: &Identity,
        context_prefix: &str,
        now: DateTime<Utc>,
    ) -> String {
        match classify(command) {
            CommandKind::Status => {
                info!(identity = %identity, "Status requested");
                self.stats.report(now)
            }
            CommandKind::Shell(cmd) => self.run_shell(cmd, identity).await,
            CommandKind::Natural(text) => {
                let prompt = prompts::with_context(context_prefix, text);
                self.run_natural(&prompt, text, identity).await
            }
        }
    }

    /// Run an already-built prompt (attachments, follow-ups) on the
    /// natural-language path. `user_text` is what the guard inspects.
    pub async fn execute_prompt(
        &self,
        prompt: &str,
        user_text: &str,
        identity: &Identity,
        context_prefix: &str,
    ) -> String {
        let prompt = prompts::with_context(context_prefix, prompt);
        self.run_natural(&prompt, user_text, identity).await
    }

    async fn run_shell(&self, cmd: &str, identity: &Identity) -> String {
        if cmd.is_empty() {
            return "❌ Empty shell command.".to_string();
        }
        if self.guard.is_blocked(cmd) {
            warn!(identity = %identity, "Blocked shell command");
            return BLOCK_RESPONSE.to_string();
        }
        match self.shell.run(cmd).await {
            Ok(output) => {
                let body = truncate_output(&output.render(), self.config.max_response_length);
                format!("```\n{body}\n```")
            }
            Err(ShellError::Timeout(t)) => format!("❌ Command timeout (>{}s)", t.as_secs()),
            Err(ShellError::Spawn(e)) => format!("❌ Execution error: {e}"),
        }
    }

    async fn run_natural(&self, prompt: &str, user_text: &str, identity: &Identity) -> String {
        if self.guard.is_blocked(user_text) {
            warn!(identity = %identity, "Blocked natural-language command");
            return BLOCK_RESPONSE.to_string();
        }
        let request = InterpreterRequest {
            prompt,
            system_instruction: Some(prompts::system_instruction()),
            allowed_capabilities: &self.config.allowed_tools,
            timeout: self.config.interpreter_timeout,
        };
        match self.interpreter.invoke(request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Interpreter call failed");
                describe_failure(self.interpreter.name(), &e)
            }
        }
    }
}

/// User-facing text for an interpreter failure, by failure class.
pub fn describe_failure(name: &str, error: &InterpreterError) -> String {
    match error {
        InterpreterError::NotFound { program } => format!(
            "❌ '{program}' command not found. Check that it is installed and on PATH."
        ),
        InterpreterError::Timeout { timeout } => {
            format!("❌ {name} timeout (>{}s)", timeout.as_secs())
        }
        InterpreterError::Failed { code, stderr } if stderr.is_empty() => {
            format!("❌ {name} error: exited with status {code:?}")
        }
        InterpreterError::Failed { stderr, .. } => format!("❌ {name} error: {stderr}"),
        InterpreterError::EmptyResponse => format!("❌ {name} returned an empty response."),
        InterpreterError::Io(e) => format!("❌ Error: {e}"),
    }
}
