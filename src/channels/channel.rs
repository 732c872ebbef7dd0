//! Canonical inbound message and the per-channel reply contract.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;
use crate::tools::shell::floor_char_boundary;

/// Placeholder glyph the message store uses where an attachment sat inline.
const OBJECT_REPLACEMENT: char = '\u{FFFC}';

/// Stream of normalized inbound messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Which adapter produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceChannel {
    /// Fixed-interval poll of the local message store (iMessage).
    StorePoll,
    /// Bot API long-poll (Telegram).
    BotApi,
}

impl SourceChannel {
    pub fn name(&self) -> &'static str {
        match self {
            SourceChannel::StorePoll => "imessage",
            SourceChannel::BotApi => "telegram",
        }
    }

    /// Channel-qualified sender id, e.g. `telegram:42`.
    pub fn qualify(&self, raw_sender: &str) -> String {
        format!("{}:{}", self.name(), raw_sender.trim())
    }
}

/// Raw attachment descriptor as delivered by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
    /// Display name (original file name when the channel provides one).
    pub name: String,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
}

impl Attachment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Self {
            path,
            name,
            mime_type: None,
            size_bytes: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.name = name;
        }
        self
    }

    pub fn with_mime_type(mut self, mime: Option<String>) -> Self {
        self.mime_type = mime;
        self
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size_bytes = size;
        self
    }
}

/// Canonical inbound unit, built once per raw event.
#[derive(Debug, Clone)]
pub struct Message {
    /// Channel-qualified sender id.
    pub sender_id: String,
    /// Normalized text: placeholder glyphs stripped, trimmed.
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// True when the event is the agent account's own outgoing message.
    pub is_self_echo: bool,
    pub received_at: DateTime<Utc>,
    pub source_channel: SourceChannel,
    /// Channel-native address replies go to (handle or chat id).
    pub reply_to: String,
}

impl Message {
    pub fn new(source_channel: SourceChannel, raw_sender: &str, text: &str) -> Self {
        Self {
            sender_id: source_channel.qualify(raw_sender),
            text: normalize_text(text),
            attachments: Vec::new(),
            is_self_echo: false,
            received_at: Utc::now(),
            source_channel,
            reply_to: raw_sender.trim().to_string(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_self_echo(mut self, is_self_echo: bool) -> Self {
        self.is_self_echo = is_self_echo;
        self
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = reply_to.into();
        self
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Strip store placeholder glyphs and surrounding whitespace.
pub fn normalize_text(raw: &str) -> String {
    raw.replace(OBJECT_REPLACEMENT, "").trim().to_string()
}

/// Outbound half of a channel.
#[async_trait]
pub trait ReplySender: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver text, chunking and retrying as the transport requires.
    async fn send_text(&self, to: &str, text: &str) -> Result<(), ChannelError>;

    /// Deliver an existing local file.
    async fn send_file(&self, to: &str, path: &Path) -> Result<(), ChannelError>;

    /// Best-effort "working on it" indicator.
    async fn send_typing(&self, _to: &str) {}
}

/// Split a message into chunks of at most `max_len` bytes.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let hard_cut = floor_char_boundary(remaining, max_len).max(
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len()),
        );
        let chunk = &remaining[..hard_cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard_cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
