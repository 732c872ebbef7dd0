//! iMessage store-poll channel.
//!
//! Reads new rows from the local Messages database (read-only), groups
//! attachment rows per message, and feeds each event through the dispatcher
//! in ROWID order. The cursor advances after every event, handled or not.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::params::Params;
use libsql::{Builder, OpenFlags, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::Dispatcher;
use crate::channels::cursor::CursorFile;
use crate::channels::{Attachment, Message, SourceChannel};
use crate::error::ChannelError;
use crate::files::expand_home;

const CHANNEL: &str = "imessage";

/// Seconds between the Unix epoch and the Apple epoch (2001-01-01).
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

const NEW_MESSAGES_SQL: &str = "
    SELECT
        message.ROWID,
        message.text,
        message.date,
        handle.id,
        attachment.filename,
        attachment.mime_type,
        attachment.transfer_name,
        attachment.total_bytes,
        message.is_from_me
    FROM message
    LEFT JOIN handle ON message.handle_id = handle.ROWID
    LEFT JOIN message_attachment_join ON message.ROWID = message_attachment_join.message_id
    LEFT JOIN attachment ON message_attachment_join.attachment_id = attachment.ROWID
    WHERE message.ROWID > ?1
      AND handle.id IN ({handles})
      AND (message.text IS NOT NULL OR attachment.ROWID IS NOT NULL)
    ORDER BY message.ROWID ASC";

/// One grouped store row.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub rowid: i64,
    pub message: Message,
}

/// Read-only reader over the Messages database.
#[derive(Debug, Clone)]
pub struct ChatDbReader {
    path: PathBuf,
    handles: Vec<String>,
}

fn read_error(reason: impl std::fmt::Display) -> ChannelError {
    ChannelError::ReadFailed {
        name: CHANNEL.into(),
        reason: reason.to_string(),
    }
}

impl ChatDbReader {
    pub fn new(path: PathBuf, handles: Vec<String>) -> Self {
        Self { path, handles }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh read-only connection per poll always sees the latest commits.
    async fn connect(&self) -> Result<libsql::Connection, ChannelError> {
        if !self.path.exists() {
            return Err(read_error(format!(
                "{} not found; grant Full Disk Access to the agent's terminal",
                self.path.display()
            )));
        }
        let db = Builder::new_local(&self.path)
            .flags(OpenFlags::SQLITE_OPEN_READ_ONLY)
            .build()
            .await
            .map_err(|e| read_error(format!("open {}: {e} (check Full Disk Access)", self.path.display())))?;
        let conn = db.connect().map_err(read_error)?;
        let _ = conn.query("PRAGMA busy_timeout = 5000", ()).await;
        Ok(conn)
    }

    /// Highest ROWID currently in the store.
    pub async fn max_rowid(&self) -> Result<i64, ChannelError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("SELECT COALESCE(MAX(ROWID), 0) FROM message", ())
            .await
            .map_err(read_error)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or_default()),
            Ok(None) => Ok(0),
            Err(e) => Err(read_error(e)),
        }
    }

    /// Events from allowed handles with ROWID above `last_seen`, oldest first.
    pub async fn fetch_since(&self, last_seen: i64) -> Result<Vec<StoreEvent>, ChannelError> {
        if self.handles.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect().await?;

        let placeholders = (0..self.handles.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = NEW_MESSAGES_SQL.replace("{handles}", &placeholders);
        let mut values = vec![Value::Integer(last_seen)];
        values.extend(self.handles.iter().map(|h| Value::Text(h.clone())));

        let mut rows = conn
            .query(&sql, Params::Positional(values))
            .await
            .map_err(read_error)?;

        let mut raw = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            raw.push(RawRow {
                rowid: as_int(row.get_value(0).ok()).unwrap_or_default(),
                text: as_text(row.get_value(1).ok()),
                apple_date: as_int(row.get_value(2).ok()),
                sender: as_text(row.get_value(3).ok()).unwrap_or_default(),
                attachment_path: as_text(row.get_value(4).ok()),
                attachment_mime: as_text(row.get_value(5).ok()),
                attachment_name: as_text(row.get_value(6).ok()),
                attachment_size: as_int(row.get_value(7).ok()),
                is_from_me: as_int(row.get_value(8).ok()).unwrap_or_default() != 0,
            });
        }
        Ok(group_rows(raw))
    }
}

fn as_int(value: Option<Value>) -> Option<i64> {
    match value? {
        Value::Integer(i) => Some(i),
        Value::Real(f) => Some(f as i64),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Text(s) => Some(s),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

/// One joined row before grouping.
#[derive(Debug, Clone, Default)]
struct RawRow {
    rowid: i64,
    text: Option<String>,
    /// Apple-epoch nanoseconds.
    apple_date: Option<i64>,
    sender: String,
    attachment_path: Option<String>,
    attachment_mime: Option<String>,
    attachment_name: Option<String>,
    attachment_size: Option<i64>,
    is_from_me: bool,
}

/// Collapse consecutive rows of the same ROWID into one event.
fn group_rows(rows: Vec<RawRow>) -> Vec<StoreEvent> {
    let mut events: Vec<(RawRow, Vec<Attachment>)> = Vec::new();
    for row in rows {
        let attachment = row.attachment_path.as_deref().map(|p| {
            let mut att = Attachment::new(expand_home(Path::new(p)))
                .with_mime_type(row.attachment_mime.clone())
                .with_size(row.attachment_size.and_then(|s| u64::try_from(s).ok()));
            if let Some(name) = &row.attachment_name {
                att = att.with_name(name.clone());
            }
            att
        });
        match events.last_mut() {
            Some((first, attachments)) if first.rowid == row.rowid => {
                attachments.extend(attachment);
            }
            _ => events.push((row, attachment.into_iter().collect())),
        }
    }

    events
        .into_iter()
        .map(|(row, attachments)| {
            let received_at = row
                .apple_date
                .and_then(apple_time_to_utc)
                .unwrap_or_else(Utc::now);
            let message = Message::new(
                SourceChannel::StorePoll,
                &row.sender,
                row.text.as_deref().unwrap_or_default(),
            )
            .with_attachments(attachments)
            .with_self_echo(row.is_from_me)
            .with_received_at(received_at);
            StoreEvent {
                rowid: row.rowid,
                message,
            }
        })
        .collect()
}

/// Apple-epoch nanoseconds to UTC.
fn apple_time_to_utc(nanos: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(nanos / 1_000_000_000 + APPLE_EPOCH_OFFSET, 0)
}

/// Spawn the poll loop. Returns a `JoinHandle` and a shutdown flag.
pub fn spawn_imessage_poller(
    reader: ChatDbReader,
    cursor: CursorFile,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let mut last_seen = initial_cursor(&reader, &cursor).await;
        info!(
            db = %reader.path().display(),
            start_rowid = last_seen,
            "iMessage poller started, polling every {}s",
            interval.as_secs()
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("iMessage poller shutting down");
                return;
            }

            poll_once(&reader, &cursor, &mut last_seen, &dispatcher).await;
        }
    });

    (handle, shutdown_flag)
}

/// Stored cursor, or the current store head on first run so history is not replayed.
async fn initial_cursor(reader: &ChatDbReader, cursor: &CursorFile) -> i64 {
    if cursor.path().exists() {
        return cursor.load().await;
    }
    match reader.max_rowid().await {
        Ok(head) => {
            if let Err(e) = cursor.save(head).await {
                warn!(error = %e, "Failed to seed cursor file");
            }
            head
        }
        Err(e) => {
            warn!(error = %e, "Could not read store head; starting from 0");
            0
        }
    }
}

/// One poll cycle: fetch, dispatch in order, advance the cursor per event.
pub async fn poll_once(
    reader: &ChatDbReader,
    cursor: &CursorFile,
    last_seen: &mut i64,
    dispatcher: &Arc<Dispatcher>,
) {
    let events = match reader.fetch_since(*last_seen).await {
        Ok(events) => events,
        Err(e) => {
            error!("iMessage poll failed: {e}");
            return;
        }
    };
    if events.is_empty() {
        return;
    }
    debug!(count = events.len(), "Fetched new iMessage events");

    for event in events {
        let rowid = event.rowid;
        debug!(
            rowid,
            sender = %event.message.sender_id,
            from_me = event.message.is_self_echo,
            attachments = event.message.attachments.len(),
            "iMessage event"
        );

        // A panic inside one dispatch must not stop the poller.
        let task_dispatcher = Arc::clone(dispatcher);
        let message = event.message;
        if let Err(e) = tokio::spawn(async move { task_dispatcher.dispatch(&message).await }).await {
            error!(rowid, "Dispatch task failed: {e}");
        }

        *last_seen = rowid;
        if let Err(e) = cursor.save(rowid).await {
            error!(rowid, error = %e, "Failed to persist cursor");
        }
    }
}
