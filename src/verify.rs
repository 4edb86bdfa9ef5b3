//! Checks whether a file left by an earlier run can be kept.

use crate::error::DownloadFailure;
use std::path::Path;
use tracing::{debug, info, warn};

/// Computes the MD5 hash of a local file.
///
/// Reads in 1MB chunks on a blocking thread so large scans do not stall the
/// runtime.
pub(crate) async fn compute_file_md5(path: &Path) -> Result<String, DownloadFailure> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        use md5::{Digest, Md5};
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| {
        DownloadFailure::IoError(std::io::Error::other(format!("Task join error: {}", e)))
    })?
}

/// Extracts an MD5 from an `ETag` header value, skipping multipart uploads
/// (their ETags contain a `-` and are not a digest of the content).
pub(crate) fn etag_md5(value: Option<&reqwest::header::HeaderValue>) -> Option<String> {
    let etag = value?.to_str().ok()?.trim().trim_start_matches("W/");
    let etag = etag.trim_matches('"');
    if etag.len() == 32 && !etag.contains('-') {
        Some(etag.to_ascii_lowercase())
    } else {
        None
    }
}

/// Decides whether an existing local file matches its remote object.
///
/// 1. A missing file needs downloading.
/// 2. With `skip_verify` an existing file is trusted as-is.
/// 3. Otherwise a HEAD request must report the same `Content-Length`, and,
///    when the `ETag` is a plain MD5, the same digest.
///
/// # Returns
///
/// `Some(byte_size)` when the file can be kept, `None` when it must be
/// (re-)downloaded. Verification problems are never errors.
pub(crate) async fn verify_local_file(
    http: &reqwest::Client,
    path: &Path,
    remote_url: &str,
    skip_verify: bool,
) -> Option<u64> {
    let local_size = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m.len(),
        _ => return None,
    };
    let display_name = path.display();

    if skip_verify {
        info!(
            "✅ File {} trusted (exists, {} bytes, verification skipped)",
            display_name, local_size
        );
        return Some(local_size);
    }

    let response = match http.head(remote_url).send().await {
        Ok(r) => match r.error_for_status() {
            Ok(resp) => resp,
            Err(e) => {
                warn!("HEAD request failed for {}: {}", remote_url, e);
                return None;
            }
        },
        Err(e) => {
            warn!("Failed to connect to {}: {}", remote_url, e);
            return None;
        }
    };

    let remote_size = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    match remote_size {
        Some(remote_size) if remote_size == local_size => {}
        Some(remote_size) => {
            info!(
                "Size mismatch for {}: local={} bytes, remote={} bytes",
                display_name, local_size, remote_size
            );
            return None;
        }
        None => {
            debug!("No Content-Length for {}, cannot verify", remote_url);
            return None;
        }
    }

    if let Some(expected) = etag_md5(response.headers().get(reqwest::header::ETAG)) {
        match compute_file_md5(path).await {
            Ok(actual) if actual == expected => {}
            Ok(actual) => {
                info!(
                    "MD5 mismatch for {}: local={}, remote={}",
                    display_name, actual, expected
                );
                return None;
            }
            Err(e) => {
                warn!("Failed to compute MD5 for {}: {}", display_name, e);
                return None;
            }
        }
    }

    info!("✅ File {} already present and verified", display_name);
    Some(local_size)
}
