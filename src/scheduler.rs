//! Bounded-concurrency download dispatch.

use crate::download::Materializer;
use crate::error::SinkError;
use crate::group::{GroupArena, GroupId};
use crate::naming::{assign_filenames, record_dir_name};
use crate::sink;
use crate::types::{DownloadStatus, MetadataRow, Record, RunResult};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Counts downloads currently in flight and remembers the highest count.
#[derive(Debug, Default)]
pub(crate) struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { gauge: self }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a> {
    gauge: &'a InFlightGauge,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What one object task hands back to the scheduler.
struct ObjectReport {
    row: MetadataRow,
    /// Set by the task that completed its record's group.
    flushed: Option<Result<PathBuf, SinkError>>,
}

/// Shared state of one dispatch, cloned into every object task.
#[derive(Clone)]
struct DispatchContext {
    materializer: Materializer,
    arena: Arc<GroupArena>,
    gauge: Arc<InFlightGauge>,
    series_dir: Arc<Path>,
    pb: indicatif::ProgressBar,
}

/// Dispatches object downloads over a single pool shared by every record.
#[derive(Debug, Clone)]
pub struct DownloadScheduler {
    materializer: Materializer,
    show_progress: bool,
}

impl DownloadScheduler {
    pub fn new(materializer: Materializer, show_progress: bool) -> Self {
        Self {
            materializer,
            show_progress,
        }
    }

    /// Downloads every object of `records` into `series_dir`.
    ///
    /// At most `concurrency` object tasks exist at once across the whole run;
    /// the producer waits for one to finish before spawning the next object,
    /// so nothing is buffered beyond the pool. Each record's CSV is written once,
    /// by whichever of its objects finishes last. Returns only after every
    /// record has been flushed.
    ///
    /// With `dry_run` set, records and objects are only counted.
    pub async fn run<I>(
        &self,
        records: I,
        series_dir: &Path,
        concurrency: usize,
        dry_run: bool,
    ) -> RunResult
    where
        I: IntoIterator<Item = Record>,
    {
        let records: Vec<Record> = records
            .into_iter()
            .filter(|r| !r.digital_objects.is_empty())
            .collect();

        let mut result = RunResult {
            records_with_objects: records.len(),
            objects_found: records.iter().map(|r| r.digital_objects.len()).sum(),
            dry_run,
            ..RunResult::default()
        };
        if dry_run {
            return result;
        }

        let mut arena = GroupArena::new();
        let mut plan = Vec::with_capacity(records.len());
        for record in records {
            let filenames = assign_filenames(&record);
            let dir = series_dir.join(record_dir_name(&record));
            let id = arena.add(&record.record_id, dir, record.digital_objects.len());
            plan.push((id, record, filenames));
        }
        debug!("Dispatching {} records", arena.len());

        let ctx = DispatchContext {
            materializer: self.materializer.clone(),
            arena: Arc::new(arena),
            gauge: Arc::new(InFlightGauge::default()),
            series_dir: Arc::from(series_dir),
            pb: progress_bar(result.objects_found as u64, self.show_progress),
        };
        let pool_size = concurrency.max(1);
        let mut tasks: JoinSet<ObjectReport> = JoinSet::new();

        for (group_id, record, filenames) in plan {
            let record_id: Arc<str> = Arc::from(record.record_id.as_str());
            for (index, (object, filename)) in
                record.digital_objects.into_iter().zip(filenames).enumerate()
            {
                while let Some(joined) = tasks.try_join_next() {
                    absorb(&mut result, joined);
                }
                // Pool full: hold the producer until a slot frees up.
                if tasks.len() >= pool_size {
                    if let Some(joined) = tasks.join_next().await {
                        absorb(&mut result, joined);
                    }
                }

                let ctx = ctx.clone();
                let record_id = Arc::clone(&record_id);
                tasks.spawn(async move {
                    let row = {
                        let _in_flight = ctx.gauge.enter();
                        ctx.pb.set_message(format!("| ⬇️  Downloading: {}", filename));
                        let dir = &ctx.arena.get(group_id).dir;
                        let attempt =
                            ctx.materializer.download(&object, &filename, &record_id, dir);
                        settle(attempt, |cause| {
                            MetadataRow::failed(&filename, &object, &record_id, cause)
                        })
                        .await
                    };
                    ctx.pb.inc(1);
                    complete_object(&ctx, group_id, index, row).await
                });
            }
        }

        // The record list is exhausted; wait for the stragglers.
        while let Some(joined) = tasks.join_next().await {
            absorb(&mut result, joined);
        }

        result.peak_in_flight = ctx.gauge.peak();
        ctx.pb.finish_with_message(format!(
            "| ✅ Downloaded {}/{} objects",
            result.objects_succeeded, result.objects_attempted
        ));
        result
    }
}

/// Records the row in its group and flushes the group's CSV if this was the
/// last outstanding object.
async fn complete_object(
    ctx: &DispatchContext,
    group_id: GroupId,
    index: usize,
    row: MetadataRow,
) -> ObjectReport {
    let flushed = match ctx.arena.complete(group_id, index, row.clone()) {
        Some(rows) => {
            let group = ctx.arena.get(group_id);
            let any_succeeded = rows.iter().any(|r| r.status == DownloadStatus::Succeeded);
            let record_dir = any_succeeded.then(|| group.dir.path());
            Some(sink::flush(&group.record_id, record_dir, &ctx.series_dir, &rows).await)
        }
        None => None,
    };
    ObjectReport { row, flushed }
}

/// Awaits one download, turning a panic inside it into a failed row so the
/// record's group still completes.
async fn settle<F, E>(attempt: F, on_panic: E) -> MetadataRow
where
    F: Future<Output = MetadataRow>,
    E: FnOnce(String) -> MetadataRow,
{
    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(row) => row,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Download task panicked: {}", reason);
            on_panic(format!("download task panicked: {}", reason))
        }
    }
}

fn absorb(result: &mut RunResult, joined: Result<ObjectReport, JoinError>) {
    let report = match joined {
        Ok(report) => report,
        Err(e) => {
            error!("Download task failed: {}", e);
            result.push_error("download task", e.to_string());
            return;
        }
    };

    let row = report.row;
    result.objects_attempted += 1;
    match row.status {
        DownloadStatus::Succeeded => result.objects_succeeded += 1,
        DownloadStatus::Failed => {
            result.objects_failed += 1;
            result.push_error(
                format!("record {} object {}", row.record_id, row.object_filename),
                row.cause.unwrap_or_else(|| "unknown failure".to_string()),
            );
        }
    }

    match report.flushed {
        Some(Ok(path)) => info!("Record {} complete: {}", row.record_id, path.display()),
        Some(Err(e)) => {
            warn!("Failed to write metadata for record {}: {}", row.record_id, e);
            result.push_error(format!("record {} metadata", row.record_id), e.to_string());
        }
        None => {}
    }
}

fn progress_bar(total: u64, show: bool) -> indicatif::ProgressBar {
    if !show || !atty::is(atty::Stream::Stderr) {
        return indicatif::ProgressBar::hidden();
    }
    let pb = indicatif::ProgressBar::new(total);
    let style = indicatif::ProgressStyle::default_bar()
        .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
        .map(|style| style.progress_chars("█▓▒░ "))
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}
