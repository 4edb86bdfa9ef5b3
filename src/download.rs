//! Digital object download functionality.

use crate::error::DownloadFailure;
use crate::group::RecordDir;
use crate::types::{DigitalObjectRef, MetadataRow, SyncConfig};
use crate::verify::{etag_md5, verify_local_file};
use futures_util::StreamExt;
use md5::{Digest, Md5};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, info, warn};

/// Transfers digital objects into record directories.
#[derive(Debug, Clone)]
pub struct Materializer {
    http: reqwest::Client,
    config: Arc<SyncConfig>,
}

impl Materializer {
    pub fn new(http: reqwest::Client, config: Arc<SyncConfig>) -> Self {
        Self { http, config }
    }

    /// Downloads one object as `filename` inside `dir`.
    ///
    /// Never fails: any problem is captured in the returned row with status
    /// `failed`, so one object cannot abort its record or the run.
    pub(crate) async fn download(
        &self,
        object: &DigitalObjectRef,
        filename: &str,
        record_id: &str,
        dir: &RecordDir,
    ) -> MetadataRow {
        let target = dir.path().join(filename);
        match self.materialize(object, &target, dir).await {
            Ok(byte_size) => MetadataRow::succeeded(filename, object, record_id, byte_size),
            Err(e) => {
                warn!("Failed to download {}: {}", object.source_url, e);
                MetadataRow::failed(filename, object, record_id, e.to_string())
            }
        }
    }

    async fn materialize(
        &self,
        object: &DigitalObjectRef,
        target: &Path,
        dir: &RecordDir,
    ) -> Result<u64, DownloadFailure> {
        let url = object.source_url.as_str();

        if tokio::fs::try_exists(target).await.unwrap_or(false) {
            if let Some(size) =
                verify_local_file(&self.http, target, url, self.config.skip_verify).await
            {
                dir.ensure().await?;
                return Ok(size);
            }
            warn!(
                "Existing file {} does not match {}, replacing it",
                target.display(),
                url
            );
        }

        let retry_strategy = ExponentialBackoff::from_millis(2)
            .factor(self.config.retry_base_delay_ms.max(1))
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(self.config.download_retries);

        Retry::spawn(retry_strategy, || async move {
            match self.transfer(url, target, dir).await {
                Ok(size) => Ok(size),
                Err(e) if e.is_transient() => {
                    debug!("Transient failure for {}, will retry: {}", url, e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        })
        .await
    }

    /// One GET: stream to a hidden partial file next to the record directory,
    /// verify, then move it into place. The record directory is only created
    /// once the body has passed every check.
    async fn transfer(
        &self,
        url: &str,
        target: &Path,
        dir: &RecordDir,
    ) -> Result<u64, DownloadFailure> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let content_length = response.content_length();
        let expected_md5 = etag_md5(response.headers().get(reqwest::header::ETAG));

        let partial = dir.staging_path(target);
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let written = match write_body(response, &partial, content_length, expected_md5).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        let moved = match dir.ensure().await {
            Ok(_) => tokio::fs::rename(&partial, target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = moved {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        info!("Downloaded {} ({} bytes)", target.display(), written);
        Ok(written)
    }
}

async fn write_body(
    response: reqwest::Response,
    partial: &Path,
    content_length: Option<u64>,
    expected_md5: Option<String>,
) -> Result<u64, DownloadFailure> {
    let mut file = BufWriter::new(tokio::fs::File::create(partial).await?);
    let mut hasher = expected_md5.as_ref().map(|_| Md5::new());
    let mut written = 0u64;

    let mut byte_stream = response.bytes_stream();
    while let Some(piece) = byte_stream.next().await {
        let chunk = piece?;
        if let Some(ref mut h) = hasher {
            h.update(&chunk);
        }
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.into_inner().sync_all().await?;

    if let Some(expected) = content_length {
        if written != expected {
            return Err(DownloadFailure::Integrity(format!(
                "expected {} bytes, got {} bytes",
                expected, written
            )));
        }
    }

    if let (Some(expected), Some(hasher)) = (expected_md5, hasher) {
        let computed = format!("{:x}", hasher.finalize());
        if computed != expected {
            return Err(DownloadFailure::Integrity(format!(
                "MD5 mismatch: expected {}, got {}",
                expected, computed
            )));
        }
    }

    Ok(written)
}
