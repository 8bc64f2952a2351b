//! Issues one ranged GET, streams the body into a part file, reports bytes,
//! and surfaces local protocol errors. Keeps the familiar range-request
//! construction, 206/200 handling, defensive truncation-to-expected-length
//! guard, and chunked buffered writes of a single-segment fetch, but routes
//! every chunk through `SpeedGate` and the `ProgressAggregator` channel
//! instead of a bare closure, and returns a typed failure on the first
//! error instead of looping retries itself — retry/backoff is
//! `MultiDownloader`'s job.

use std::path::Path;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{parse_retry_after, DownloadError};
use crate::progress::ProgressEvent;
use crate::speed_gate::{RateSource, SpeedGate};
use crate::types::{RequestContext, SegmentRange};

const WRITE_BUF_CAPACITY: usize = 256 * 1024;

/// What one successful attempt produced.
#[derive(Debug, Clone, Copy)]
pub struct SegmentOutcome {
    pub index: u64,
    pub bytes_written: u64,
}

pub struct SegmentDownloader;

impl SegmentDownloader {
    /// One attempt at downloading `range` into `part_path`. Truncates and
    /// seeks to 0 at the start of every attempt by always recreating
    /// the file. `whole_file` means no `Range` header is sent (the N=1 /
    /// non-rangeable path); in that case `range.len()` is ignored as a bound.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        client: &Client,
        url: &str,
        range: SegmentRange,
        whole_file: bool,
        ctx: &RequestContext,
        part_path: &Path,
        speed_gate: &SpeedGate,
        rate_source: &dyn RateSource,
        progress_tx: &mpsc::Sender<Result<ProgressEvent, String>>,
        cancel: &CancellationToken,
    ) -> Result<SegmentOutcome, DownloadError> {
        let mut builder = client.get(url);
        for (key, value) in &ctx.headers {
            builder = builder.header(key, value);
        }
        builder = builder.header("Connection", "keep-alive");

        let expected_len = range.len();
        if !whole_file {
            log::info!(
                "[segment_downloader] segment={}: requesting Range: bytes={}-{}",
                range.index, range.start, range.end
            );
            builder = builder.header("Range", format!("bytes={}-{}", range.start, range.end));
        } else {
            log::info!("[segment_downloader] segment={}: no Range header (whole file)", range.index);
        }

        let response = builder.send().await.map_err(DownloadError::Network)?;
        let status = response.status();

        log::info!(
            "[segment_downloader] segment={}: response status={}, content_length={:?}",
            range.index,
            status,
            response.content_length()
        );

        if !whole_file && status != StatusCode::PARTIAL_CONTENT {
            // Either the server ignored Range (200) or returned a hard
            // failure status — both are protocol errors for a real segment.
            return Err(DownloadError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
                retry_after_secs: parse_retry_after(response.headers()),
            });
        }
        if whole_file && status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
                retry_after_secs: parse_retry_after(response.headers()),
            });
        }

        let file = tokio::fs::File::create(part_path).await.map_err(DownloadError::Disk)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUF_CAPACITY, file);

        let mut bytes_written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            if cancel.is_cancelled() {
                let _ = writer.flush().await;
                return Err(DownloadError::Cancelled);
            }

            let chunk = chunk_result.map_err(DownloadError::Network)?;

            // Defensive truncation: a server that ignores Range and sends
            // the full body would otherwise produce an over-sized segment;
            // never write past the requested range.
            let to_write: &[u8] = if !whole_file {
                let remaining = expected_len.saturating_sub(bytes_written);
                let usable = (chunk.len() as u64).min(remaining) as usize;
                &chunk[..usable]
            } else {
                &chunk[..]
            };

            if to_write.is_empty() {
                break;
            }

            writer.write_all(to_write).await.map_err(DownloadError::Disk)?;
            let written = to_write.len() as u64;
            bytes_written += written;

            speed_gate.on_write(written, rate_source).await;
            let _ = progress_tx
                .send(Ok(ProgressEvent {
                    segment_index: range.index,
                    bytes_delta: written,
                    total_bytes: if whole_file { None } else { Some(expected_len) },
                }))
                .await;

            if !whole_file && bytes_written >= expected_len {
                break;
            }
        }

        writer.flush().await.map_err(DownloadError::Disk)?;

        if !whole_file && bytes_written != expected_len {
            log::error!(
                "[segment_downloader] segment={}: short body, expected={} actual={}",
                range.index, expected_len, bytes_written
            );
            return Err(DownloadError::ShortBody {
                expected: expected_len,
                actual: bytes_written,
            });
        }

        log::info!(
            "[segment_downloader] segment={}: finished, {} bytes written",
            range.index, bytes_written
        );

        Ok(SegmentOutcome {
            index: range.index,
            bytes_written,
        })
    }
}
