//! Error types for the offline download pipeline
//!
//! `ComicError` is the crate-wide error. It knows which failures are worth
//! retrying and how to describe itself in one line for a failed job record.

use std::path::PathBuf;

use crate::core::retry::Retryable;
use crate::remote::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum ComicError {
    // System-level errors
    #[error("System initialization failed: {0}")]
    InitializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    // Remote content API
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    // Local storage
    #[error("Failed to delete {}: {source}", path.display())]
    DeleteFileError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Progress {0} is outside 0..=100")]
    InvalidProgress(i32),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Unexpected error: {context}: {source}")]
    Unexpected {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ComicError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ComicError::InitializationError(_) => "InitializationError",
            ComicError::ConfigError(_) => "ConfigError",
            ComicError::DatabaseError(_) => "DatabaseError",
            ComicError::Remote(_) => "RemoteError",
            ComicError::DeleteFileError { .. } => "DeleteFileError",
            ComicError::IoError(_) => "IoError",
            ComicError::NotFound(_) => "NotFound",
            ComicError::ValidationError(_) => "ValidationError",
            ComicError::InvalidProgress(_) => "InvalidProgress",
            ComicError::SerializationError(_) => "SerializationError",
            ComicError::TaskError(_) => "TaskError",
            ComicError::Cancelled => "Cancelled",
            ComicError::Unexpected { .. } => "Unexpected",
        }
    }

    /// Network trouble and local I/O hiccups are transient. Server answers,
    /// malformed payloads and everything else are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ComicError::Remote(e) => e.is_retryable(),
            ComicError::IoError(_) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ComicError::Cancelled)
    }

    /// One-line description stored on failed jobs and shown in notices
    pub fn short_message(&self) -> String {
        match self {
            ComicError::Remote(RemoteError::Unreachable(_)) => "Network unavailable".to_string(),
            ComicError::Remote(RemoteError::Timeout(_)) => "Request timed out".to_string(),
            ComicError::Remote(RemoteError::Server { status, message }) => {
                format!("Server error {}: {}", status, message)
            }
            ComicError::Remote(RemoteError::Malformed(_)) => "Unexpected response from server".to_string(),
            ComicError::DeleteFileError { path, .. } => {
                format!("Could not delete {}", path.display())
            }
            ComicError::IoError(e) => format!("Storage error: {}", e),
            ComicError::DatabaseError(_) => "Database error".to_string(),
            ComicError::Cancelled => "Cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

impl Retryable for ComicError {
    fn is_retryable(&self) -> bool {
        ComicError::is_retryable(self)
    }
}

impl From<serde_json::Error> for ComicError {
    fn from(err: serde_json::Error) -> Self {
        ComicError::SerializationError(err.to_string())
    }
}

impl From<crate::core::config::ConfigError> for ComicError {
    fn from(err: crate::core::config::ConfigError) -> Self {
        ComicError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ComicError>;

/// Context extension trait for adding context to errors. The original error
/// stays reachable through `source()`.
pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ComicError::Unexpected {
            context: context.into(),
            source: Box::new(e),
        })
    }
}
