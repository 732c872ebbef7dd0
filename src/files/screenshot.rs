//! Screen capture into the outbox, and outbox housekeeping.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Local;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::files::unique_path;
use crate::tools::osascript;
use crate::tools::shell::run_program;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces a screenshot file, optionally after focusing an application.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self, app: Option<&str>) -> Result<PathBuf, ChannelError>;
}

/// `screencapture -x` on macOS.
#[derive(Debug, Clone)]
pub struct MacScreenCapture {
    outbox_dir: PathBuf,
}

impl MacScreenCapture {
    pub fn new(outbox_dir: PathBuf) -> Self {
        Self { outbox_dir }
    }
}

fn capture_error(reason: impl Into<String>) -> ChannelError {
    ChannelError::SendFailed {
        name: "screenshot".into(),
        reason: reason.into(),
    }
}

#[async_trait]
impl ScreenCapture for MacScreenCapture {
    async fn capture(&self, app: Option<&str>) -> Result<PathBuf, ChannelError> {
        tokio::fs::create_dir_all(&self.outbox_dir)
            .await
            .map_err(|e| capture_error(e.to_string()))?;

        if let Some(app) = app {
            let script = format!(
                "tell application \"{}\" to activate\ndelay 0.5",
                osascript::escape(app)
            );
            if let Err(e) = osascript::run(&script, osascript::OSASCRIPT_TIMEOUT).await {
                warn!(app, error = %e, "Failed to activate application");
            }
        }

        let name = format!("screenshot_{}.png", Local::now().format("%Y%m%d_%H%M%S"));
        let path = unique_path(&self.outbox_dir, &name);
        let target = path.to_string_lossy();
        let output = run_program("screencapture", &["-x", &*target], CAPTURE_TIMEOUT)
            .await
            .map_err(|e| capture_error(e.to_string()))?;
        if !path.exists() {
            warn!(exit_code = output.exit_code, "screencapture produced no file");
            return Err(capture_error(
                "no image produced (Screen Recording permission may be needed)",
            ));
        }
        info!(path = %path.display(), "Screenshot captured");
        Ok(path)
    }
}

/// Move outbox files older than `max_age` into `outbox/archive/`.
/// Files are never deleted. Returns the number moved.
pub async fn archive_stale_outbox(outbox: &Path, max_age: Duration) -> std::io::Result<usize> {
    archive_stale_outbox_at(outbox, max_age, SystemTime::now()).await
}

pub async fn archive_stale_outbox_at(
    outbox: &Path,
    max_age: Duration,
    now: SystemTime,
) -> std::io::Result<usize> {
    if !outbox.exists() {
        return Ok(0);
    }
    let archive = outbox.join("archive");
    tokio::fs::create_dir_all(&archive).await?;

    let mut moved = 0;
    let mut entries = tokio::fs::read_dir(outbox).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age > max_age {
            let dest = unique_path(&archive, &entry.file_name().to_string_lossy());
            tokio::fs::rename(entry.path(), &dest).await?;
            debug!(file = %dest.display(), "Archived outbox file");
            moved += 1;
        }
    }
    if moved > 0 {
        info!(moved, "Archived stale outbox files");
    }
    Ok(moved)
}
