//! Archivesync - Fetch archival catalog series and download their digital objects
//!
//! This library pages through a catalog API for the children of a series,
//! keeps a verbatim snapshot of what the catalog returned, and downloads every
//! digital object into one directory per record alongside a metadata CSV.
//!
//! # Features
//!
//! - **Snapshot Every Run**: Raw catalog pages are written to `results_{id}.json`
//! - **Bounded Parallelism**: One download pool shared by all records
//! - **Isolated Failures**: A failed object is recorded, never fatal
//! - **Resumable Downloads**: Verified files from earlier runs are kept
//! - **Automatic Retry**: Backoff for transient catalog and download failures
//!
//! # Example
//!
//! ```no_run
//! use archivesync::{sync_series, SeriesQuery, SyncConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::default();
//! let query = SeriesQuery::new("5573655", 50).dry_run(true);
//!
//! let result = sync_series(&config, &query).await?;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```

mod catalog;
mod download;
mod error;
mod extract;
mod group;
mod naming;
mod orchestrator;
mod scheduler;
mod sink;
mod types;
mod verify;

pub use catalog::{CatalogClient, CatalogPage, CatalogPager, PageCursor};
pub use download::Materializer;
pub use error::{DownloadFailure, FetchError, SinkError, SyncError};
pub use extract::{extract, Extraction};
pub use naming::{record_dir_name, series_dir, snapshot_path, to_snake_case};
pub use orchestrator::sync_series;
pub use scheduler::DownloadScheduler;
pub use sink::encode_rows;
pub use types::{
    DigitalObjectRef, DownloadStatus, MetadataRow, Record, RunError, RunResult, SeriesQuery,
    SyncConfig,
};
