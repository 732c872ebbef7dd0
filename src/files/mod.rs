//! Local file handling: inbound attachment staging and outbound captures.

pub mod attachments;
pub mod screenshot;

pub use attachments::{AttachmentKind, AttachmentStager, StagedAttachment, attachment_prompt};
pub use screenshot::{MacScreenCapture, ScreenCapture, archive_stale_outbox};

use std::path::{Path, PathBuf};

use crate::config::home_dir;

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// First free path for `name` in `dir`, appending `_1`, `_2`, … to the stem.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_tilde_only_at_start() {
        assert_eq!(expand_home(Path::new("~/x.txt")), home_dir().join("x.txt"));
        assert_eq!(expand_home(Path::new("/tmp/~x")), PathBuf::from("/tmp/~x"));
    }

    #[test]
    fn unique_path_adds_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "a.txt"), dir.path().join("a.txt"));
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        assert_eq!(unique_path(dir.path(), "a.txt"), dir.path().join("a_1.txt"));
        std::fs::write(dir.path().join("a_1.txt"), "2").unwrap();
        assert_eq!(unique_path(dir.path(), "a.txt"), dir.path().join("a_2.txt"));
        std::fs::write(dir.path().join("README"), "3").unwrap();
        assert_eq!(unique_path(dir.path(), "README"), dir.path().join("README_1"));
    }
}
