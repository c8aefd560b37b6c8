//! Ranged multi-worker file transfer.
//!
//! One transfer: HEAD for size and extension, the byte range `[0, size)`
//! partitioned into contiguous chunks, one streaming `Range` GET per chunk
//! written to `chunk_<i>.tmp`, then an index-order merge into the final
//! file. Memory use stays at O(workers × chunk buffer) regardless of file
//! size because bodies are streamed straight to disk.

use futures_util::StreamExt;
use rand::Rng;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{CancelSet, DownloadError};

/// Progress callback: `(percent, aggregate bytes/sec)`.
pub type ProgressFn = Arc<dyn Fn(f64, Option<u64>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: String,
    pub url: String,
    /// Per-download scratch directory holding the chunk files.
    pub tmp_dir: PathBuf,
    /// Where the merged output file lands.
    pub output_dir: PathBuf,
    pub max_workers: usize,
}

/// Runs a transfer to completion and returns the merged file path.
pub async fn execute(
    client: &Client,
    request: &TransferRequest,
    cancel: &CancelSet,
    on_progress: ProgressFn,
) -> Result<PathBuf, DownloadError> {
    if cancel.contains(&request.id) {
        return Err(DownloadError::Cancelled);
    }

    let head = client
        .head(&request.url)
        .timeout(Duration::from_secs(10))
        .send()
        .await?;
    if !head.status().is_success() {
        return Err(DownloadError::Status(head.status().as_u16()));
    }

    let size = head
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .ok_or(DownloadError::NoContentLength)?;

    let extension = detect_extension(
        head.headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        &request.url,
    );

    if cancel.contains(&request.id) {
        return Err(DownloadError::Cancelled);
    }

    tokio::fs::create_dir_all(&request.tmp_dir).await?;

    let ranges = partition(size, request.max_workers);
    debug!(
        id = %request.id,
        size,
        workers = ranges.len(),
        "Starting ranged transfer"
    );

    let downloaded = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(ranges.len());
    for (index, (start, end)) in ranges.iter().copied().enumerate() {
        let client = client.clone();
        let url = request.url.clone();
        let chunk_path = chunk_path(&request.tmp_dir, index);
        let counter = Arc::clone(&downloaded);
        let cancel = cancel.clone();
        let id = request.id.clone();
        let on_progress = Arc::clone(&on_progress);

        tasks.push(tokio::spawn(async move {
            download_range(
                &client,
                &url,
                (start, end),
                &chunk_path,
                &counter,
                size,
                started,
                &cancel,
                &id,
                &on_progress,
            )
            .await
        }));
    }

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(DownloadError::Aborted),
        }
    }

    if cancel.contains(&request.id) {
        return Err(DownloadError::Cancelled);
    }

    let output = request
        .output_dir
        .join(format!("{}.{extension}", random_token()));
    merge_chunks(&request.tmp_dir, ranges.len(), &output).await?;
    tokio::fs::remove_dir_all(&request.tmp_dir).await.ok();

    let elapsed = started.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 {
        Some((size as f64 / elapsed) as u64)
    } else {
        None
    };
    (*on_progress)(100.0, speed);

    Ok(output)
}

#[allow(clippy::too_many_arguments)]
async fn download_range(
    client: &Client,
    url: &str,
    (start, end): (u64, u64),
    chunk_path: &Path,
    counter: &AtomicU64,
    total_size: u64,
    started: Instant,
    cancel: &CancelSet,
    id: &str,
    on_progress: &ProgressFn,
) -> Result<(), DownloadError> {
    let response = client
        .get(url)
        .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(DownloadError::Status(response.status().as_u16()));
    }

    let mut file = File::create(chunk_path).await?;
    let chunk_len = end - start + 1;
    let mut local: u64 = 0;
    let mut last_step: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(piece) = stream.next().await {
        if cancel.contains(id) {
            return Err(DownloadError::Cancelled);
        }

        let piece = piece?;
        file.write_all(&piece).await?;

        local += piece.len() as u64;
        let total = counter.fetch_add(piece.len() as u64, Ordering::Relaxed) + piece.len() as u64;

        // Report at ~10% chunk-local steps so workers do not flood the queue.
        let step = local * 10 / chunk_len;
        if step > last_step {
            last_step = step;
            let percent = (total as f64 / total_size as f64) * 100.0;
            let elapsed = started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                Some((total as f64 / elapsed) as u64)
            } else {
                None
            };
            (**on_progress)(percent.min(100.0), speed);
        }
    }

    file.flush().await?;
    Ok(())
}

async fn merge_chunks(
    tmp_dir: &Path,
    count: usize,
    output: &Path,
) -> Result<(), DownloadError> {
    let mut out = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(output)
        .await?;

    for index in 0..count {
        let mut chunk = File::open(chunk_path(tmp_dir, index)).await?;
        tokio::io::copy(&mut chunk, &mut out).await?;
    }

    out.flush().await?;
    Ok(())
}

fn chunk_path(tmp_dir: &Path, index: usize) -> PathBuf {
    tmp_dir.join(format!("chunk_{index}.tmp"))
}

/// Splits `[0, size)` into at most `workers` contiguous inclusive byte
/// ranges; the last range absorbs the remainder.
#[must_use]
pub fn partition(size: u64, workers: usize) -> Vec<(u64, u64)> {
    let workers = (workers.max(1) as u64).min(size);
    let chunk = size / workers;

    (0..workers)
        .map(|i| {
            let start = i * chunk;
            let end = if i == workers - 1 {
                size - 1
            } else {
                (i + 1) * chunk - 1
            };
            (start, end)
        })
        .collect()
}

/// Prefers the `Content-Disposition` filename, falls back to the URL path,
/// then to `mp4`.
#[must_use]
pub fn detect_extension(content_disposition: Option<&str>, url: &str) -> String {
    if let Some(disposition) = content_disposition
        && let Some(filename) = disposition
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("filename="))
        && let Some(ext) = extension_of(filename.trim_matches('"'))
    {
        return ext;
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    extension_of(path).unwrap_or_else(|| "mp4".to_string())
}

fn extension_of(name: &str) -> Option<String> {
    let ext = name.rsplit('.').next()?;
    let valid = !ext.is_empty()
        && ext.len() <= 5
        && ext != name
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

fn random_token() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| {
            let n: u8 = rng.random_range(0..36);
            char::from_digit(u32::from(n), 36).unwrap_or('0')
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_hundred_mib_into_four_ranges() {
        let ranges = partition(104_857_600, 4);
        assert_eq!(
            ranges,
            vec![
                (0, 26_214_399),
                (26_214_400, 52_428_799),
                (52_428_800, 78_643_199),
                (78_643_200, 104_857_599),
            ]
        );
    }

    #[test]
    fn partition_covers_every_byte_without_overlap() {
        for (size, workers) in [(1u64, 3usize), (10, 3), (104_857_601, 4), (7, 10)] {
            let ranges = partition(size, workers);
            assert!(ranges.len() <= workers.max(1));

            let mut expected_start = 0u64;
            for (start, end) in &ranges {
                assert_eq!(*start, expected_start);
                assert!(end >= start);
                expected_start = end + 1;
            }
            assert_eq!(expected_start, size);
        }
    }

    #[test]
    fn detects_extension_from_disposition_then_url() {
        assert_eq!(
            detect_extension(
                Some(r#"attachment; filename="Show.S01E01.mkv""#),
                "https://cdn.test/file"
            ),
            "mkv"
        );
        assert_eq!(
            detect_extension(None, "https://cdn.test/path/episode-5.mp4?token=abc"),
            "mp4"
        );
        assert_eq!(detect_extension(None, "https://cdn.test/no-extension"), "mp4");
    }

    #[test]
    fn random_tokens_are_filename_safe() {
        let token = random_token();
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
