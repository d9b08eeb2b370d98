//! Error types for runner acquisition

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for runner cache operations
pub type Result<T> = std::result::Result<T, AcquisitionError>;

/// Errors that can occur while locating or downloading the runner
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// The acquisition was cancelled through its token
    #[error("Runner acquisition was cancelled")]
    Cancelled,

    /// The download request failed
    #[error("Failed to download runner from {url}: {message}")]
    DownloadFailed {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The server answered with a non-success status
    #[error("Runner download from {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// The downloaded file is empty or missing after download
    #[error("Downloaded runner at {path} is invalid: {reason}")]
    InvalidRunner { path: PathBuf, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcquisitionError {
    /// Create a DownloadFailed error
    pub fn download_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a DownloadFailed error with source
    pub fn download_failed_with_source(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Whether this error represents a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
