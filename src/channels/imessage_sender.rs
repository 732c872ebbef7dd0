//! Outbound iMessage through AppleScript.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::channels::ReplySender;
use crate::error::ChannelError;
use crate::tools::osascript;

/// Max characters per iMessage chunk.
pub const MAX_CHUNK_CHARS: usize = 1500;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const CHUNK_GAP: Duration = Duration::from_millis(500);

/// Sends text and files to a handle via Messages.app.
#[derive(Debug, Clone, Default)]
pub struct IMessageSender;

impl IMessageSender {
    pub fn new() -> Self {
        Self
    }
}

fn text_script(handle: &str, text: &str) -> String {
    format!(
        "tell application \"Messages\"\n\
         \x20   set targetService to 1st account whose service type = iMessage\n\
         \x20   send \"{}\" to participant \"{}\" of targetService\n\
         end tell",
        osascript::escape(text),
        osascript::escape(handle)
    )
}

fn file_script(handle: &str, path: &Path) -> String {
    format!(
        "tell application \"Messages\"\n\
         \x20   set targetService to 1st account whose service type = iMessage\n\
         \x20   send POSIX file \"{}\" to participant \"{}\" of targetService\n\
         end tell",
        osascript::escape(&path.to_string_lossy()),
        osascript::escape(handle)
    )
}

fn send_error(reason: impl Into<String>) -> ChannelError {
    ChannelError::SendFailed {
        name: "imessage".into(),
        reason: reason.into(),
    }
}

/// Split on newline, then space, then hard cut, at most `max_chars` chars each.
pub fn chunk_chars(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };
        let head = &remaining[..limit];
        let cut = head
            .rfind('\n')
            .or_else(|| head.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);
        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start();
    }
    chunks
}

#[async_trait]
impl ReplySender for IMessageSender {
    fn name(&self) -> &str {
        "imessage"
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<(), ChannelError> {
        if text.is_empty() {
            return Ok(());
        }
        let chunks = chunk_chars(text, MAX_CHUNK_CHARS);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            let script = text_script(to, chunk);
            let mut sent = false;
            for attempt in 1..=MAX_ATTEMPTS {
                match osascript::run(&script, osascript::OSASCRIPT_TIMEOUT).await {
                    Ok(_) => {
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, max = MAX_ATTEMPTS, error = %e, "iMessage send failed");
                        if attempt < MAX_ATTEMPTS {
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                    }
                }
            }
            if !sent {
                return Err(send_error(format!("chunk {}/{total} failed after {MAX_ATTEMPTS} attempts", i + 1)));
            }
            if i + 1 < total {
                tokio::time::sleep(CHUNK_GAP).await;
            }
        }
        info!(to, chunks = total, "iMessage sent");
        Ok(())
    }

    async fn send_file(&self, to: &str, path: &Path) -> Result<(), ChannelError> {
        let path = std::path::absolute(path).map_err(|e| send_error(e.to_string()))?;
        if !path.is_file() {
            return Err(ChannelError::FileNotFound(path));
        }
        osascript::run(&file_script(to, &path), osascript::OSASCRIPT_TIMEOUT)
            .await
            .map_err(|e| send_error(e.to_string()))?;
        info!(to, file = %path.display(), "iMessage file sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_escape_text_and_handle() {
        let script = text_script("+1555", "say \"hi\"\nbye");
        assert!(script.contains("send \"say \\\"hi\\\"\\nbye\" to participant \"+1555\""));

        let script = file_script("me@icloud.com", Path::new("/tmp/a \"b\".txt"));
        assert!(script.contains("send POSIX file \"/tmp/a \\\"b\\\".txt\""));
    }

    #[test]
    fn chunks_respect_char_limit() {
        assert_eq!(chunk_chars("short", 1500), vec!["short"]);

        let text = format!("{}\n{}", "a".repeat(1000), "b".repeat(1000));
        let chunks = chunk_chars(&text, 1500);
        assert_eq!(chunks, vec!["a".repeat(1000), "b".repeat(1000)]);

        let wide = "é".repeat(3100);
        let chunks = chunk_chars(&wide, 1500);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1500));
        assert_eq!(chunks.concat(), wide);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = IMessageSender::new()
            .send_file("+1555", Path::new("/nonexistent/x.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::FileNotFound(_)));
    }
}
