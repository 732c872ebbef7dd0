//! Persistent read cursor for the message store poller.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Highest message id already handled, stored as decimal text.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored cursor, or 0 when missing or unreadable.
    pub async fn load(&self) -> i64 {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(path = %self.path.display(), "Cursor file is corrupt; starting from 0");
                0
            }),
            Err(_) => 0,
        }
    }

    /// Write through a temp file and rename so a crash never leaves a torn value.
    pub async fn save(&self, value: i64) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, value.to_string()).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_or_corrupt_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorFile::new(dir.path().join("last_rowid.txt"));
        assert_eq!(cursor.load().await, 0);

        std::fs::write(cursor.path(), "not a number").unwrap();
        assert_eq!(cursor.load().await, 0);
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorFile::new(dir.path().join("state/last_rowid.txt"));
        cursor.save(1234).await.unwrap();
        cursor.save(1240).await.unwrap();
        assert_eq!(cursor.load().await, 1240);
        assert!(!dir.path().join("state/last_rowid.tmp").exists());
    }
}
