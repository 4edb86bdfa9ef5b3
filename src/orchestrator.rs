//! Main orchestration logic for syncing a series.

use crate::catalog::{CatalogClient, CatalogPage, CatalogPager};
use crate::download::Materializer;
use crate::error::SyncError;
use crate::extract::{extract, Extraction};
use crate::naming::{is_valid_series_id, series_dir, snapshot_path};
use crate::scheduler::DownloadScheduler;
use crate::sink::partial_path;
use crate::types::{RunResult, SeriesQuery, SyncConfig};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Init,
    Fetching,
    SnapshotWritten,
    DryRunDone,
    Downloading,
    Done,
    Failed,
}

struct RunTracker {
    state: RunState,
    series_id: String,
}

impl RunTracker {
    fn new(series_id: &str) -> Self {
        Self {
            state: RunState::Init,
            series_id: series_id.to_string(),
        }
    }

    fn advance(&mut self, next: RunState) {
        debug!("Series {}: {:?} -> {:?}", self.series_id, self.state, next);
        self.state = next;
    }
}

/// Fetches a series from the catalog and downloads its digital objects.
///
/// This is the main entry point. It performs the following steps:
///
/// 1. Pages through the catalog until the series or `limit` is exhausted
/// 2. Writes the raw pages to `results_{seriesId}.json` (every run)
/// 3. Unless `dry_run` is set, downloads every digital object into
///    `output_{seriesId}/{recordId}_{title}/` with one metadata CSV per record
///
/// # Arguments
///
/// * `config` - Endpoint, credential, pool size and output location
/// * `query` - Series, record limit and dry-run flag
///
/// # Returns
///
/// The run summary. Object failures are reported inside it; only a failure
/// while paging the catalog aborts the run, in which case nothing has been
/// written to disk.
///
/// # Example
///
/// ```no_run
/// use archivesync::{sync_series, SeriesQuery, SyncConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = SyncConfig {
///     credential: "my-api-key".to_string(),
///     ..SyncConfig::default()
/// };
/// let result = sync_series(&config, &SeriesQuery::new("5573655", 50)).await?;
/// println!("{}", result);
/// # Ok(())
/// # }
/// ```
pub async fn sync_series(
    config: &SyncConfig,
    query: &SeriesQuery,
) -> Result<RunResult, SyncError> {
    if !is_valid_series_id(&query.series_id) {
        return Err(SyncError::InvalidQuery(query.series_id.clone()));
    }

    let started = Instant::now();
    let config = Arc::new(config.clone());
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;
    let mut tracker = RunTracker::new(&query.series_id);

    tracker.advance(RunState::Fetching);
    let client = CatalogClient::new(http.clone(), Arc::clone(&config));
    info!(
        "Fetching series {} from {}",
        query.series_id,
        client.series_url(&query.series_id)
    );
    let pages = match CatalogPager::new(&client, &query.series_id, query.limit)
        .collect_pages()
        .await
    {
        Ok(pages) => pages,
        Err(e) => {
            tracker.advance(RunState::Failed);
            error!("Fetching series {} failed: {}", query.series_id, e);
            return Err(e.into());
        }
    };

    let snapshot = snapshot_path(&config.output_root, &query.series_id);
    if let Err(e) = write_snapshot(&snapshot, &pages).await {
        tracker.advance(RunState::Failed);
        return Err(e);
    }
    tracker.advance(RunState::SnapshotWritten);
    info!("✅ Results written to {}", snapshot.display());

    let extraction = extract_unique(&pages);
    let records_seen = extraction.seen;
    let malformed_records = extraction.malformed;

    let scheduler = DownloadScheduler::new(
        Materializer::new(http, Arc::clone(&config)),
        config.show_progress,
    );
    let output_dir = series_dir(&config.output_root, &query.series_id);

    if query.dry_run {
        tracker.advance(RunState::DryRunDone);
        info!("Skipping download; see {} for results", snapshot.display());
    } else if extraction.records.is_empty() {
        info!("No digitized records found.");
    } else {
        tracker.advance(RunState::Downloading);
        info!("{} digitized records found.", extraction.records.len());
    }

    let mut result = scheduler
        .run(
            extraction.records,
            &output_dir,
            config.concurrency,
            query.dry_run,
        )
        .await;
    result.records_seen = records_seen;
    result.malformed_records = malformed_records;

    tracker.advance(RunState::Done);
    let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
    info!(
        "Series {} finished in {}: {}",
        query.series_id,
        humantime::format_duration(elapsed),
        result
    );
    Ok(result)
}

/// Extracts every page in order, dropping records whose id was already seen.
fn extract_unique(pages: &[CatalogPage]) -> Extraction {
    let mut all = Extraction::default();
    let mut seen_ids = HashSet::new();
    for page in pages {
        let mut extraction = extract(page);
        extraction.records.retain(|record| {
            if seen_ids.insert(record.record_id.clone()) {
                true
            } else {
                warn!("Skipping duplicate record {}", record.record_id);
                all.malformed += 1;
                false
            }
        });
        all.merge(extraction);
    }
    all
}

/// Persists the raw pages, in fetch order, as a JSON array.
async fn write_snapshot(path: &Path, pages: &[CatalogPage]) -> Result<(), SyncError> {
    let bodies: Vec<&Value> = pages.iter().map(|page| &page.body).collect();
    let json = serde_json::to_vec_pretty(&bodies)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(path);
    tokio::fs::write(&partial, json).await?;
    if let Err(e) = tokio::fs::rename(&partial, path).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PageCursor;
    use serde_json::json;

    fn page(cursor: u32, ids: &[u64]) -> CatalogPage {
        let hits: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({ "_source": { "record": { "naId": id, "title": "t", "digitalObjects": [
                    { "objectUrl": format!("https://s3/{}.jpg", id) }
                ] } } })
            })
            .collect();
        CatalogPage::from_body(
            PageCursor(cursor),
            json!({ "body": { "hits": { "hits": hits } } }),
        )
        .unwrap()
    }

    #[test]
    fn test_extract_unique_drops_repeated_ids() {
        let pages = [page(1, &[1, 2]), page(2, &[2, 3])];
        let extraction = extract_unique(&pages);

        let ids: Vec<_> = extraction.records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(extraction.seen, 4);
        assert_eq!(extraction.malformed, 1);
    }

    #[tokio::test]
    async fn test_write_snapshot_keeps_page_order() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("nested").join("results_1.json");

        write_snapshot(&path, &[page(1, &[5]), page(2, &[6])])
            .await
            .unwrap();

        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let pages = written.as_array().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1]["body"]["hits"]["hits"][0]["_source"]["record"]["naId"], 6);
    }

    #[tokio::test]
    async fn test_invalid_series_id_is_rejected_before_any_io() {
        let root = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            output_root: root.path().to_path_buf(),
            ..SyncConfig::default()
        };
        let err = sync_series(&config, &SeriesQuery::new("../x", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidQuery(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
