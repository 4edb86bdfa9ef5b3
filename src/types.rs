//! Data structures for series sync operations.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by every stage of a run.
///
/// # Example
///
/// ```
/// use archivesync::SyncConfig;
///
/// let config = SyncConfig {
///     credential: "my-api-key".to_string(),
///     concurrency: 16,
///     ..SyncConfig::default()
/// };
/// assert_eq!(config.page_size, 100);
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base API URL (e.g., `<https://catalog.archives.gov/api/v2>`)
    pub endpoint: String,
    /// Records requested per catalog page (0 is treated as 1).
    pub page_size: usize,
    /// Maximum number of downloads in flight across the whole run (default: 8).
    ///
    /// Note: This is a single pool shared by all records, not a per-record cap.
    pub concurrency: usize,
    /// API key sent as `x-api-key` on every catalog request.
    pub credential: String,
    /// Directory receiving `results_{id}.json` and `output_{id}/`.
    pub output_root: PathBuf,
    /// Per-request network timeout.
    pub request_timeout: Duration,
    /// Retries of transient catalog failures (at least one is always made).
    pub max_fetch_retries: usize,
    /// Retries of transient object download failures.
    pub download_retries: usize,
    /// Base delay of the exponential backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Trust files left by a previous run without checking them against the
    /// remote object (default: false).
    pub skip_verify: bool,
    /// Draw a progress bar while downloading.
    pub show_progress: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://catalog.archives.gov/api/v2".to_string(),
            page_size: 100,
            concurrency: 8,
            credential: String::new(),
            output_root: PathBuf::from("."),
            request_timeout: Duration::from_secs(60),
            max_fetch_retries: 3,
            download_retries: 2,
            retry_base_delay_ms: 500,
            skip_verify: false,
            show_progress: true,
        }
    }
}

/// Immutable input of a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesQuery {
    /// Catalog identifier of the parent series.
    pub series_id: String,
    /// Maximum number of records to fetch. Zero fetches nothing.
    pub limit: usize,
    /// Catalog and snapshot only; skip every download.
    pub dry_run: bool,
}

impl SeriesQuery {
    /// Creates a query for a full run.
    pub fn new(series_id: impl Into<String>, limit: usize) -> Self {
        Self {
            series_id: series_id.into(),
            limit,
            dry_run: false,
        }
    }

    /// Switches the query to dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// One catalog entry that carries at least one digital object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_id: String,
    pub title: String,
    /// In catalog order.
    pub digital_objects: Vec<DigitalObjectRef>,
}

/// A downloadable file attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitalObjectRef {
    /// Remote object storage URL.
    pub source_url: String,
    pub suggested_filename: String,
    pub mime_hint: Option<String>,
}

/// Outcome of one attempted object download.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Succeeded => f.write_str("succeeded"),
            DownloadStatus::Failed => f.write_str("failed"),
        }
    }
}

/// One CSV row per attempted digital object.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    #[serde(rename = "filename")]
    pub object_filename: String,
    pub source_url: String,
    pub record_id: String,
    #[serde(rename = "timestamp")]
    pub download_timestamp: String,
    pub byte_size: u64,
    pub status: DownloadStatus,
    /// Captured failure cause. Reported through the run result, not the CSV.
    #[serde(skip)]
    pub cause: Option<String>,
}

impl MetadataRow {
    /// Row for an object now present on disk.
    pub fn succeeded(
        filename: &str,
        object: &DigitalObjectRef,
        record_id: &str,
        byte_size: u64,
    ) -> Self {
        Self {
            object_filename: filename.to_string(),
            source_url: object.source_url.clone(),
            record_id: record_id.to_string(),
            download_timestamp: now_rfc3339(),
            byte_size,
            status: DownloadStatus::Succeeded,
            cause: None,
        }
    }

    /// Row for an object that could not be materialized.
    pub fn failed(
        filename: &str,
        object: &DigitalObjectRef,
        record_id: &str,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            object_filename: filename.to_string(),
            source_url: object.source_url.clone(),
            record_id: record_id.to_string(),
            download_timestamp: now_rfc3339(),
            byte_size: 0,
            status: DownloadStatus::Failed,
            cause: Some(cause.into()),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A failure recorded during a run, with where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    pub context: String,
    pub cause: String,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    /// Catalog entries seen, including those without digital objects.
    pub records_seen: usize,
    pub records_with_objects: usize,
    /// Digital objects carried by those records.
    pub objects_found: usize,
    /// Entries skipped because their shape could not be understood.
    pub malformed_records: usize,
    pub objects_attempted: usize,
    pub objects_succeeded: usize,
    pub objects_failed: usize,
    /// Most downloads observed in flight at the same time.
    pub peak_in_flight: usize,
    pub dry_run: bool,
    pub errors: Vec<RunError>,
}

impl RunResult {
    pub(crate) fn push_error(&mut self, context: impl Into<String>, cause: impl Into<String>) {
        self.errors.push(RunError {
            context: context.into(),
            cause: cause.into(),
        });
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records seen, {} with digital objects ({} objects), {} malformed",
            self.records_seen,
            self.records_with_objects,
            self.objects_found,
            self.malformed_records
        )?;
        if self.dry_run {
            return write!(f, " (dry run, downloads skipped)");
        }
        write!(
            f,
            "; {} objects attempted, {} succeeded, {} failed",
            self.objects_attempted, self.objects_succeeded, self.objects_failed
        )?;
        for error in &self.errors {
            write!(f, "\n  - {}: {}", error.context, error.cause)?;
        }
        Ok(())
    }
}
