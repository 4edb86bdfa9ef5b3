//! Per-record metadata CSV output.

use crate::error::SinkError;
use crate::naming::{csv_name, failed_csv_name};
use crate::types::MetadataRow;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Encodes rows with the fixed header
/// `filename,source_url,record_id,timestamp,byte_size,status`.
pub fn encode_rows(rows: &[MetadataRow]) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| SinkError::IoError(e.into_error()))
}

/// Writes the metadata CSV of one record.
///
/// `record_dir` is `Some` when at least one object of the record succeeded,
/// so its directory exists; the CSV then lands inside it. Otherwise the
/// CSV is written next to the record directories as
/// `records_{id}_failed.csv`, so failed attempts remain auditable without
/// creating an empty record directory.
///
/// # Returns
///
/// The path of the written CSV.
pub async fn flush(
    record_id: &str,
    record_dir: Option<&Path>,
    series_dir: &Path,
    rows: &[MetadataRow],
) -> Result<PathBuf, SinkError> {
    let target = match record_dir {
        Some(dir) => dir.join(csv_name(record_id)),
        None => {
            tokio::fs::create_dir_all(series_dir).await?;
            series_dir.join(failed_csv_name(record_id))
        }
    };

    let bytes = encode_rows(rows)?;
    let partial = partial_path(&target);
    tokio::fs::write(&partial, &bytes).await?;
    if let Err(e) = tokio::fs::rename(&partial, &target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }

    debug!("Wrote {} rows to {}", rows.len(), target.display());
    Ok(target)
}

/// Hidden sibling used while a file is being written.
pub(crate) fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.part", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DownloadStatus;

    fn row(name: &str, status: DownloadStatus, size: u64) -> MetadataRow {
        MetadataRow {
            object_filename: name.to_string(),
            source_url: format!("https://s3/{}", name),
            record_id: "77".to_string(),
            download_timestamp: "2024-05-01T12:00:00Z".to_string(),
            byte_size: size,
            status,
            cause: Some("ignored".to_string()),
        }
    }

    #[test]
    fn test_encode_rows_has_fixed_columns() {
        let bytes = encode_rows(&[
            row("a.jpg", DownloadStatus::Succeeded, 10),
            row("b, c.jpg", DownloadStatus::Failed, 0),
        ])
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "filename,source_url,record_id,timestamp,byte_size,status",
                "a.jpg,https://s3/a.jpg,77,2024-05-01T12:00:00Z,10,succeeded",
                "\"b, c.jpg\",\"https://s3/b, c.jpg\",77,2024-05-01T12:00:00Z,0,failed",
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_into_record_dir() {
        let root = tempfile::tempdir().unwrap();
        let record_dir = root.path().join("77_title");
        std::fs::create_dir_all(&record_dir).unwrap();

        let path = flush(
            "77",
            Some(&record_dir),
            root.path(),
            &[row("a.jpg", DownloadStatus::Succeeded, 10)],
        )
        .await
        .unwrap();

        assert_eq!(path, record_dir.join("records_77.csv"));
        assert!(path.is_file());
        assert!(!partial_path(&path).exists());
    }

    #[tokio::test]
    async fn test_flush_without_record_dir_goes_to_series_root() {
        let root = tempfile::tempdir().unwrap();
        let series_dir = root.path().join("output_1");

        let path = flush(
            "77",
            None,
            &series_dir,
            &[row("a.jpg", DownloadStatus::Failed, 0)],
        )
        .await
        .unwrap();

        assert_eq!(path, series_dir.join("records_77_failed.csv"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.ends_with("failed\n"));
    }
}
