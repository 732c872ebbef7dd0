//! Telegram channel: long-polls the Bot API for updates.
//!
//! The producer task (long poll plus media downloads) pushes normalized
//! messages into an unbounded channel; the consumer task dispatches them.
//! Polling therefore continues while a command is running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::agent::Dispatcher;
use crate::channels::{Attachment, Message, MessageStream, ReplySender, SourceChannel, split_message};
use crate::error::ChannelError;
use crate::files::{AttachmentKind, unique_path};

/// Chunk size for sendMessage (the API limit is 4096).
const TELEGRAM_CHUNK_LEN: usize = 4000;

/// Seconds each getUpdates call may hold the connection.
const LONG_POLL_SECS: u64 = 30;

/// Pause after a failed poll.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling for every non-poll request, including uploads and downloads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// getUpdates holds the connection for LONG_POLL_SECS, plus slack.
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(LONG_POLL_SECS + 15);

/// Bot API client shared by the producer and the reply sender.
#[derive(Clone)]
pub struct TelegramBot {
    token: SecretString,
    allowed_ids: Vec<i64>,
    inbox_dir: PathBuf,
    client: reqwest::Client,
}

/// Media reference found in an update, not yet downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub file_id: String,
    pub file_name: String,
}

/// The parts of one update the channel cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUpdate {
    pub update_id: i64,
    pub user_id: i64,
    pub chat_id: i64,
    pub text: String,
    pub media: Vec<MediaRef>,
}

fn send_error(reason: impl Into<String>) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason: reason.into(),
    }
}

impl TelegramBot {
    pub fn new(token: SecretString, allowed_ids: Vec<i64>, inbox_dir: PathBuf) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| send_error(format!("http client: {e}")))?;
        Ok(Self {
            token,
            allowed_ids,
            inbox_dir,
            client,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.token.expose_secret()
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "https://api.telegram.org/file/bot{}/{file_path}",
            self.token.expose_secret()
        )
    }

    /// Only listed numeric user ids are accepted; an empty list accepts nobody.
    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        self.allowed_ids.contains(&user_id)
    }

    /// Start the long-poll producer and return its message stream.
    pub fn start(&self) -> MessageStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let bot = self.clone();

        tokio::spawn(async move {
            let mut offset = bot.skip_backlog().await;
            info!("Telegram channel listening for messages...");

            loop {
                let updates = match bot.get_updates(offset).await {
                    Ok(updates) => updates,
                    Err(e) => {
                        warn!("Telegram poll error: {e}");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                        continue;
                    }
                };

                offset = next_offset(&updates, offset);
                for update in &updates {
                    let Some(parsed) = parse_update(update) else {
                        continue;
                    };
                    if !bot.is_user_allowed(parsed.user_id) {
                        warn!(user_id = parsed.user_id, "Telegram: ignoring message from unauthorized user");
                        continue;
                    }
                    let message = bot.build_message(parsed).await;
                    if tx.send(message).is_err() {
                        info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    /// Offset past whatever queued up while the agent was down.
    /// Falls back to 0 (replay) if the server cannot be reached.
    async fn skip_backlog(&self) -> i64 {
        match self.fetch_updates(-1, 0).await {
            Ok(pending) => {
                let offset = next_offset(&pending, 0);
                if offset > 0 {
                    info!(offset, "Telegram: skipping updates queued before startup");
                }
                offset
            }
            Err(e) => {
                warn!("Telegram backlog skip failed: {e}");
                0
            }
        }
    }

    async fn get_updates(&self, offset: i64) -> anyhow::Result<Vec<Value>> {
        self.fetch_updates(offset, LONG_POLL_SECS).await
    }

    async fn fetch_updates(&self, offset: i64, timeout_secs: u64) -> anyhow::Result<Vec<Value>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"]
        });
        let data: Value = self
            .client
            .post(self.api_url("getUpdates"))
            .timeout(POLL_REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if data.get("ok").and_then(Value::as_bool) == Some(false) {
            let description = data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            anyhow::bail!("getUpdates failed: {description}");
        }
        Ok(data
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Download media into the inbox and build the canonical message.
    async fn build_message(&self, parsed: ParsedUpdate) -> Message {
        let mut attachments = Vec::new();
        for media in &parsed.media {
            match self.download(media).await {
                Ok(path) => attachments.push(Attachment::new(path).with_name(media.file_name.clone())),
                Err(e) => warn!(file = %media.file_name, "Telegram download failed: {e}"),
            }
        }
        Message::new(SourceChannel::BotApi, &parsed.user_id.to_string(), &parsed.text)
            .with_reply_to(parsed.chat_id.to_string())
            .with_attachments(attachments)
    }

    async fn download(&self, media: &MediaRef) -> anyhow::Result<PathBuf> {
        let meta: Value = self
            .client
            .post(self.api_url("getFile"))
            .json(&serde_json::json!({ "file_id": media.file_id }))
            .send()
            .await?
            .json()
            .await?;
        let Some(remote_path) = meta
            .get("result")
            .and_then(|r| r.get("file_path"))
            .and_then(Value::as_str)
        else {
            anyhow::bail!("getFile returned no file_path");
        };

        let bytes = self
            .client
            .get(self.file_url(remote_path))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        tokio::fs::create_dir_all(&self.inbox_dir).await?;
        let dest = unique_path(&self.inbox_dir, &media.file_name);
        tokio::fs::write(&dest, &bytes).await?;
        debug!(path = %dest.display(), bytes = bytes.len(), "Telegram file downloaded");
        Ok(dest)
    }

    /// Send a single chunk, Markdown first with plain-text fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });
        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| send_error(e.to_string()))?;
        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        warn!(status = ?markdown_status, "Telegram sendMessage with Markdown failed; retrying without parse_mode");

        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| send_error(e.to_string()))?;
        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(send_error(format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
            )));
        }
        Ok(())
    }

    /// Upload a local file as a photo or document.
    pub async fn send_media(&self, chat_id: &str, file_path: &Path, method: &str, field: &str) -> anyhow::Result<()> {
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let file_bytes = tokio::fs::read(file_path).await?;
        let part = Part::bytes(file_bytes).file_name(file_name.clone());
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), part);

        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            let err = resp.text().await?;
            anyhow::bail!("Telegram {method} failed: {err}");
        }
        info!("Telegram {field} sent to {chat_id}: {file_name}");
        Ok(())
    }
}

#[async_trait]
impl ReplySender for TelegramBot {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_CHUNK_LEN) {
            self.send_message_chunk(to, &chunk).await?;
        }
        Ok(())
    }

    async fn send_file(&self, to: &str, path: &Path) -> Result<(), ChannelError> {
        if !path.is_file() {
            return Err(ChannelError::FileNotFound(path.to_path_buf()));
        }
        let (method, field) = upload_method(path);
        self.send_media(to, path, method, field)
            .await
            .map_err(|e| send_error(e.to_string()))
    }

    async fn send_typing(&self, to: &str) {
        let result = self
            .client
            .post(self.api_url("sendChatAction"))
            .json(&serde_json::json!({ "chat_id": to, "action": "typing" }))
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = ?resp.status(), "Telegram sendChatAction failed");
            }
            Ok(_) => {}
            Err(e) => warn!("Telegram sendChatAction failed: {e}"),
        }
    }
}

/// Offset acknowledging every update in `updates`; `current` if there are none.
fn next_offset(updates: &[Value], current: i64) -> i64 {
    updates
        .iter()
        .filter_map(|u| u.get("update_id").and_then(Value::as_i64))
        .map(|uid| uid + 1)
        .fold(current, i64::max)
}

/// Images go through sendPhoto, everything else through sendDocument.
fn upload_method(path: &Path) -> (&'static str, &'static str) {
    match AttachmentKind::of(path) {
        AttachmentKind::Image => ("sendPhoto", "photo"),
        _ => ("sendDocument", "document"),
    }
}

/// Extract sender, chat, text (or caption) and media from one update.
pub fn parse_update(update: &Value) -> Option<ParsedUpdate> {
    let update_id = update.get("update_id").and_then(Value::as_i64)?;
    let message = update.get("message")?;
    let user_id = message.get("from")?.get("id")?.as_i64()?;
    let chat_id = message.get("chat")?.get("id")?.as_i64()?;
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut media = Vec::new();
    // Photo sizes are listed smallest first.
    if let Some(largest) = message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
        && let Some(file_id) = largest.get("file_id").and_then(Value::as_str)
    {
        media.push(MediaRef {
            file_id: file_id.to_string(),
            file_name: format!("photo_{update_id}.jpg"),
        });
    }
    if let Some(document) = message.get("document")
        && let Some(file_id) = document.get("file_id").and_then(Value::as_str)
    {
        let file_name = document
            .get("file_name")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("document_{update_id}"));
        media.push(MediaRef {
            file_id: file_id.to_string(),
            file_name,
        });
    }

    if text.trim().is_empty() && media.is_empty() {
        return None;
    }
    Some(ParsedUpdate {
        update_id,
        user_id,
        chat_id,
        text,
        media,
    })
}

/// Spawn the consumer loop. Returns a `JoinHandle` and a shutdown flag.
pub fn spawn_telegram_channel(
    bot: Arc<TelegramBot>,
    dispatcher: Arc<Dispatcher>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let mut stream = bot.start();
        while let Some(message) = stream.next().await {
            if shutdown.load(Ordering::Relaxed) {
                info!("Telegram channel shutting down");
                return;
            }
            let task_dispatcher = Arc::clone(&dispatcher);
            if let Err(e) = tokio::spawn(async move { task_dispatcher.dispatch(&message).await }).await {
                error!("Telegram dispatch task failed: {e}");
            }
        }
        info!("Telegram stream ended");
    });

    (handle, shutdown_flag)
}
