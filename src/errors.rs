use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Download manager is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Error delivered to observers when a transfer fails.
///
/// Cloned once per registered observer, so every variant carries owned text
/// rather than the underlying source error.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadError {
    /// Connection, HTTP status or stall failure. The caller may enqueue again.
    #[error("Network error: {0}")]
    Network(String),

    /// Disk full, permission denied, invalid path.
    #[error("Storage error: {0}")]
    Storage(String),

    /// License or key delivery rejected the request.
    #[error("DRM error: {0}")]
    Drm(String),

    #[error("Unsupported source: {0}")]
    Unsupported(String),

    /// The run was cancelled by pause, dequeue or shutdown. Never surfaced to observers.
    #[error("Transfer cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether a fresh enqueue has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Network(_))
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(error: std::io::Error) -> Self {
        DownloadError::Storage(error.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        DownloadError::Network(error.to_string())
    }
}
