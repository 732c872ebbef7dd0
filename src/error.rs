//! Error types for the relay agent.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Interpreter error: {0}")]
    Interpreter(#[from] InterpreterError),

    #[error("Attachment error: {0}")]
    Attachment(#[from] AttachmentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to read from channel {name}: {reason}")]
    ReadFailed { name: String, reason: String },

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

/// Failures of the external command interpreter.
#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("'{program}' command not found")]
    NotFound { program: String },

    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("returned an empty response")]
    EmptyResponse,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Attachment staging errors.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("Attachment not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("{name} is too large ({size_mb:.1}MB, limit {limit_mb}MB)")]
    TooLarge {
        name: String,
        size_mb: f64,
        limit_mb: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
