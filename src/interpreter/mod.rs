//! External command interpreter.
//!
//! The interpreter is an opaque process that turns a prompt into text. It is
//! used for natural-language commands and for daily summarization.

mod claude_cli;

pub use claude_cli::ClaudeCli;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::InterpreterError;

/// One interpreter call.
#[derive(Debug, Clone, Copy)]
pub struct InterpreterRequest<'a> {
    pub prompt: &'a str,
    pub system_instruction: Option<&'a str>,
    /// Capabilities the interpreter may use (empty for text-only calls).
    pub allowed_capabilities: &'a [String],
    pub timeout: Duration,
}

impl<'a> InterpreterRequest<'a> {
    /// A text-only request with no system instruction or capabilities.
    pub fn text(prompt: &'a str, timeout: Duration) -> Self {
        Self {
            prompt,
            system_instruction: None,
            allowed_capabilities: &[],
            timeout,
        }
    }
}

/// Turns prompts into text.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Short name used in logs and failure messages.
    fn name(&self) -> &str;

    /// Run one prompt to completion, bounded by `request.timeout`.
    async fn invoke(&self, request: InterpreterRequest<'_>) -> Result<String, InterpreterError>;
}
