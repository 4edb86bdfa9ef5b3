//! Error types for series sync operations.

use std::io;
use thiserror::Error;

/// Errors raised while paging the catalog API.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Authentication failure or any other 4xx. Never retried.
    #[error("Catalog request to {url} rejected: HTTP {status}")]
    Fatal {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Network failure or 5xx. Retried with backoff.
    #[error("Catalog request to {url} failed: {reason}")]
    Transient {
        /// Request URL.
        url: String,
        /// Human-readable cause.
        reason: String,
    },

    /// Response body was not a catalog page.
    #[error("Invalid catalog response from {url}: {reason}")]
    InvalidResponse {
        /// Request URL.
        url: String,
        /// Human-readable cause.
        reason: String,
    },
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Errors that abort a run before any download starts.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The series identifier cannot be used to name files on disk.
    #[error("Invalid series id {0:?}: expected letters, digits, '-' or '_'")]
    InvalidQuery(String),

    /// Paging failed fatally (or exhausted its retries).
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// I/O error while writing the snapshot or creating directories.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// Snapshot serialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// HTTP client could not be constructed.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
}

/// Errors writing a record's metadata CSV.
#[derive(Error, Debug)]
pub enum SinkError {
    /// I/O error writing the CSV.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// CSV encoding error.
    #[error(transparent)]
    CsvError(#[from] csv::Error),
}

/// Why a single digital object could not be materialized.
///
/// Captured into the object's metadata row; never propagated to the run.
#[derive(Error, Debug)]
pub enum DownloadFailure {
    /// I/O error writing the object.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// Network error or non-2xx response.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// Transferred bytes did not match what the server announced.
    #[error("Integrity check failed: {0}")]
    Integrity(String),
}

impl DownloadFailure {
    /// Network errors and 5xx responses are worth another attempt; 4xx and
    /// local write errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadFailure::ReqwestError(e) => match e.status() {
                Some(status) => status.is_server_error() || status.as_u16() == 429,
                None => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            },
            DownloadFailure::Integrity(_) => true,
            DownloadFailure::IoError(_) => false,
        }
    }
}
