//! Directives embedded in interpreter output.
//!
//! Grammar:
//! - `[SEND_FILE:<path>]` sends a local file (`~` is expanded by the sink)
//! - `[SEND_SCREENSHOT]` / `[SEND_SCREENSHOT:<app>]` captures the screen,
//!   optionally bringing `<app>` to the front first
//! - `[NEED_INPUT:<question>]` asks the user a clarification question
//!
//! Directives are parsed into [`Directive`] values before any side effect
//! runs, then executed strictly in the order they occur.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::error::ChannelError;

static SEND_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[SEND_FILE:([^\]]+)\]|\[SEND_SCREENSHOT(?::([^\]]*))?\]")
        .expect("send directive regex is valid")
});

static NEED_INPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[NEED_INPUT:(.*?)\]").expect("clarification regex is valid")
});

/// A parsed send instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    SendFile(PathBuf),
    SendScreenshot(Option<String>),
}

/// A directive and the byte span it occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDirective {
    pub span: Range<usize>,
    pub directive: Directive,
}

/// Channel-supplied executor for send directives.
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Perform the send. Returns the path of the artifact that was sent.
    async fn deliver(&self, directive: &Directive) -> Result<PathBuf, ChannelError>;
}

/// Result of running every directive in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedReply {
    /// Reply text with each directive replaced by its status line.
    pub text: String,
    pub sent: usize,
    pub failed: usize,
}

/// All send directives in left-to-right order.
pub fn parse_directives(text: &str) -> Vec<ParsedDirective> {
    SEND_DIRECTIVE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let directive = if let Some(path) = caps.get(1) {
                let path = path.as_str().trim();
                if path.is_empty() {
                    return None;
                }
                Directive::SendFile(PathBuf::from(path))
            } else {
                let app = caps
                    .get(2)
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|s| !s.is_empty());
                Directive::SendScreenshot(app)
            };
            Some(ParsedDirective {
                span: whole.range(),
                directive,
            })
        })
        .collect()
}

/// Execute each directive once per occurrence and rewrite the text.
pub async fn process(text: &str, sink: &dyn FileSink) -> ProcessedReply {
    let parsed = parse_directives(text);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut sent = 0;
    let mut failed = 0;

    for ParsedDirective { span, directive } in parsed {
        out.push_str(&text[cursor..span.start]);
        let status = match sink.deliver(&directive).await {
            Ok(artifact) => {
                sent += 1;
                info!(artifact = %artifact.display(), "Directive delivered");
                success_line(&directive, &artifact)
            }
            Err(e) => {
                failed += 1;
                warn!(directive = ?directive, error = %e, "Directive failed");
                failure_line(&directive, &e)
            }
        };
        out.push_str(&status);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);

    ProcessedReply {
        text: out,
        sent,
        failed,
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn success_line(directive: &Directive, artifact: &Path) -> String {
    match directive {
        Directive::SendFile(_) => format!("📎 {} sent", display_name(artifact)),
        Directive::SendScreenshot(Some(app)) => format!("📸 Screenshot of {app} sent"),
        Directive::SendScreenshot(None) => "📸 Screenshot sent".to_string(),
    }
}

fn failure_line(directive: &Directive, error: &ChannelError) -> String {
    match directive {
        Directive::SendFile(path) => {
            format!("⚠️ {} not sent: {error}", display_name(path))
        }
        Directive::SendScreenshot(_) => format!("⚠️ Screenshot failed: {error}"),
    }
}

/// Strip every `[NEED_INPUT:…]` marker, returning the first question.
pub fn extract_clarification(text: &str) -> (String, Option<String>) {
    let question = NEED_INPUT
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| !q.is_empty());
    if question.is_none() && !NEED_INPUT.is_match(text) {
        return (text.to_string(), None);
    }
    let cleaned = NEED_INPUT.replace_all(text, "").trim().to_string();
    (cleaned, question)
}
