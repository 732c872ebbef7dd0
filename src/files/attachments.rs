//! Inbound attachment staging.
//!
//! Each attachment is size-checked, copied into the inbox under a
//! collision-free name, and prepared for the interpreter: HEIC/HEIF images
//! are converted to JPEG, documents get their text extracted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channels::Attachment;
use crate::error::AttachmentError;
use crate::files::{expand_home, unique_path};
use crate::tools::shell::{floor_char_boundary, run_program};

/// Cap on extracted document text, in bytes.
pub const MAX_EXTRACTED_BYTES: usize = 5000;

/// Timeout for conversion and extraction helpers.
const HELPER_TIMEOUT: Duration = Duration::from_secs(30);

const TEXT_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "json", "yaml", "yml", "toml", "txt", "md", "csv", "xml", "html", "css",
    "sh", "bash", "zsh", "conf", "cfg", "ini", "log", "sql", "r", "swift", "kt", "java", "c",
    "cpp", "h", "go", "rs", "rb", "php", "pl", "lua",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "heic", "heif", "webp", "bmp", "tiff", "tif", "svg",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "rtf", "pages", "numbers", "key",
];

/// Attachment class by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Text,
    Image,
    Document,
    Binary,
}

impl AttachmentKind {
    pub fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let ext = ext.as_str();
        if TEXT_EXTENSIONS.contains(&ext) {
            AttachmentKind::Text
        } else if IMAGE_EXTENSIONS.contains(&ext) {
            AttachmentKind::Image
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            AttachmentKind::Document
        } else {
            AttachmentKind::Binary
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Text => "text",
            AttachmentKind::Image => "image",
            AttachmentKind::Document => "document",
            AttachmentKind::Binary => "binary",
        }
    }
}

/// An attachment copied into the inbox and ready for the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAttachment {
    pub name: String,
    pub path: PathBuf,
    pub kind: AttachmentKind,
    pub extracted_text: Option<String>,
}

/// Copies attachments into the inbox and prepares them.
#[derive(Debug, Clone)]
pub struct AttachmentStager {
    inbox_dir: PathBuf,
    max_file_bytes: u64,
    max_image_bytes: u64,
}

impl AttachmentStager {
    pub fn new(inbox_dir: PathBuf, max_file_mb: u64, max_image_mb: u64) -> Self {
        Self {
            inbox_dir,
            max_file_bytes: max_file_mb * 1024 * 1024,
            max_image_bytes: max_image_mb * 1024 * 1024,
        }
    }

    pub fn inbox_dir(&self) -> &Path {
        &self.inbox_dir
    }

    /// Stage every attachment, collecting failures as user-facing lines.
    pub async fn stage_all(&self, attachments: &[Attachment]) -> (Vec<StagedAttachment>, Vec<String>) {
        let mut staged = Vec::new();
        let mut failures = Vec::new();
        for attachment in attachments {
            match self.stage(attachment).await {
                Ok(s) => staged.push(s),
                Err(e) => {
                    warn!(name = %attachment.name, error = %e, "Attachment not staged");
                    failures.push(format!("⚠️ {}: {e}", attachment.name));
                }
            }
        }
        (staged, failures)
    }

    pub async fn stage(&self, attachment: &Attachment) -> Result<StagedAttachment, AttachmentError> {
        let source = expand_home(&attachment.path);
        let metadata = tokio::fs::metadata(&source)
            .await
            .map_err(|_| AttachmentError::NotFound(source.clone()))?;
        let kind = AttachmentKind::of(&source);

        let limit = match kind {
            AttachmentKind::Image => self.max_image_bytes.min(self.max_file_bytes),
            _ => self.max_file_bytes,
        };
        if metadata.len() > limit {
            return Err(AttachmentError::TooLarge {
                name: attachment.name.clone(),
                size_mb: metadata.len() as f64 / (1024.0 * 1024.0),
                limit_mb: limit / (1024 * 1024),
            });
        }

        let mut path = self.copy_into_inbox(&source).await?;
        let mut extracted_text = None;
        match kind {
            AttachmentKind::Image if is_heic(&path) => {
                if let Some(jpeg) = convert_heic(&path).await {
                    path = jpeg;
                }
            }
            AttachmentKind::Document => {
                extracted_text = Some(extract_text(&path).await);
            }
            _ => {}
        }

        info!(name = %attachment.name, kind = kind.as_str(), path = %path.display(), "Attachment staged");
        Ok(StagedAttachment {
            name: attachment.name.clone(),
            path,
            kind,
            extracted_text,
        })
    }

    async fn copy_into_inbox(&self, source: &Path) -> Result<PathBuf, AttachmentError> {
        if source.parent() == Some(self.inbox_dir.as_path()) {
            return Ok(source.to_path_buf());
        }
        tokio::fs::create_dir_all(&self.inbox_dir).await?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let dest = unique_path(&self.inbox_dir, &name);
        tokio::fs::copy(source, &dest).await?;
        Ok(dest)
    }
}

fn is_heic(path: &Path) -> bool {
    path.extension()
        .map(|e| matches!(e.to_string_lossy().to_lowercase().as_str(), "heic" | "heif"))
        .unwrap_or(false)
}

/// Convert to JPEG beside the original with `sips`. `None` keeps the original.
async fn convert_heic(path: &Path) -> Option<PathBuf> {
    let jpeg = path.with_extension("jpg");
    let (src, dst) = (path.to_string_lossy(), jpeg.to_string_lossy());
    match run_program("sips", &["-s", "format", "jpeg", &*src, "--out", &*dst], HELPER_TIMEOUT).await {
        Ok(_) if jpeg.exists() => {
            debug!(path = %jpeg.display(), "Converted HEIC to JPEG");
            Some(jpeg)
        }
        Ok(out) => {
            warn!(stderr = %out.stderr.trim(), "sips produced no JPEG");
            None
        }
        Err(e) => {
            warn!(error = %e, "HEIC conversion failed");
            None
        }
    }
}

/// Document text via `textutil`, falling back to `strings`.
async fn extract_text(path: &Path) -> String {
    let p = path.to_string_lossy();
    if let Ok(out) = run_program("textutil", &["-convert", "txt", "-stdout", &*p], HELPER_TIMEOUT).await
        && out.exit_code == 0
        && !out.stdout.trim().is_empty()
    {
        return cap(&out.stdout);
    }
    match run_program("strings", &[&*p], HELPER_TIMEOUT).await {
        Ok(out) if !out.stdout.trim().is_empty() => cap(&out.stdout),
        _ => "[text extraction failed]".to_string(),
    }
}

fn cap(text: &str) -> String {
    text[..floor_char_boundary(text, MAX_EXTRACTED_BYTES)].to_string()
}

/// One natural-language prompt covering every staged file and the user text.
pub fn attachment_prompt(staged: &[StagedAttachment], user_text: &str) -> String {
    let mut prompt = format!("The user sent {} file(s):\n", staged.len());
    for (i, file) in staged.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. [{}] {} (saved at {})\n",
            i + 1,
            file.kind.as_str(),
            file.name,
            file.path.display()
        ));
        if let Some(text) = &file.extracted_text {
            prompt.push_str(&format!("Extracted text:\n---\n{}\n---\n", text.trim()));
        }
    }
    let user_text = user_text.trim();
    let user_text = if user_text.is_empty() {
        "(analyze the file)"
    } else {
        user_text
    };
    prompt.push_str(&format!(
        "\nUser message: {user_text}\n\nRead the files from the paths above and process the user's request."
    ));
    prompt
}
