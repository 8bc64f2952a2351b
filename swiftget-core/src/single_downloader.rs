//! One connection, straight to the destination path. Used both as the
//! `N=1`/non-rangeable path and as `MultiDownloader`'s fallback target.
//! Grounded in a non-resumable whole-file GET branch (no `Range` header,
//! accept the whole body), with resume support added: if `--resume` is set
//! and the destination already exists, request `Range: bytes=<existing_size>-`
//! and append, accepting 206 for resume or 200 for restart (truncating
//! first in that case).

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::checksum::ChecksumVerifier;
use crate::error::{DownloadError, EngineError};
use crate::error_classifier::{classify, ClassifyContext};
use crate::progress::{ProgressAggregator, ProgressEvent, ProgressObserver};
use crate::speed_gate::{RateSource, SpeedGate};
use crate::types::{DownloadStats, RequestContext, Transfer};

const WRITE_BUF_CAPACITY: usize = 256 * 1024;

pub struct SingleDownloaderConfig {
    pub max_bps: u64,
    pub resume: bool,
    pub request_ctx: RequestContext,
}

pub struct SingleDownloader;

impl SingleDownloader {
    pub async fn run(
        transfer: &Transfer,
        cfg: &SingleDownloaderConfig,
        client: &Client,
        observers: Vec<Box<dyn ProgressObserver>>,
        cancel: &CancellationToken,
    ) -> Result<DownloadStats, EngineError> {
        let existing_size = if cfg.resume {
            tokio::fs::metadata(&transfer.destination).await.map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let (progress_tx, progress_rx) = mpsc::channel(256);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let mut aggregator = ProgressAggregator::new(1);
        for observer in observers {
            aggregator.add_observer(observer);
        }
        let aggregator_handle = tokio::spawn(aggregator.run(progress_rx, completion_rx));

        let result = Self::fetch(transfer, cfg, client, existing_size, &progress_tx, cancel).await;
        drop(progress_tx);

        if result.is_ok() {
            let _ = completion_tx.send(0);
        }
        drop(completion_tx);
        let _ = aggregator_handle.await;

        let bytes_written = result.map_err(|err| {
            let ctx = ClassifyContext::default();
            let class = classify(&err, &ctx);
            EngineError::from_class(class, &err)
        })?;

        if let Some(digest) = &transfer.expected_digest {
            ChecksumVerifier::verify(&transfer.destination, digest.algorithm, &digest.hex)
                .await
                .map_err(|err| match err {
                    DownloadError::IntegrityMismatch { expected, actual } => {
                        EngineError::IntegrityMismatch { expected, actual }
                    }
                    other => EngineError::LocalIo(other.to_string()),
                })?;
        }

        Ok(DownloadStats {
            bytes_downloaded: bytes_written,
            segments_completed: 1,
            segments_total: 1,
            ..Default::default()
        })
    }

    async fn fetch(
        transfer: &Transfer,
        cfg: &SingleDownloaderConfig,
        client: &Client,
        existing_size: u64,
        progress_tx: &mpsc::Sender<Result<ProgressEvent, String>>,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut builder = client.get(&transfer.url);
        for (key, value) in &cfg.request_ctx.headers {
            builder = builder.header(key, value);
        }
        builder = builder.header("Connection", "keep-alive");

        let resuming = existing_size > 0;
        if resuming {
            log::info!("[single_downloader] resuming at offset {}", existing_size);
            builder = builder.header("Range", format!("bytes={}-", existing_size));
        }

        let response = builder.send().await.map_err(DownloadError::Network)?;
        let status = response.status();

        let (append, offset) = match status {
            StatusCode::PARTIAL_CONTENT if resuming => (true, existing_size),
            StatusCode::OK => (false, 0),
            other => {
                return Err(DownloadError::UnexpectedStatus {
                    status: other.as_u16(),
                    url: transfer.url.clone(),
                    retry_after_secs: crate::error::parse_retry_after(response.headers()),
                })
            }
        };

        if let Some(parent) = transfer.destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(DownloadError::Disk)?;
        }

        let file = if append {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&transfer.destination)
                .await
                .map_err(DownloadError::Disk)?
        } else {
            tokio::fs::File::create(&transfer.destination).await.map_err(DownloadError::Disk)?
        };
        let mut writer = BufWriter::with_capacity(WRITE_BUF_CAPACITY, file);

        let gate = SpeedGate::with_defaults();
        let rate: Box<dyn RateSource> = Box::new(crate::speed_gate::FixedRate(cfg.max_bps));

        let total_bytes = response.content_length().map(|cl| cl + offset);
        let mut bytes_written: u64 = offset;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            if cancel.is_cancelled() {
                let _ = writer.flush().await;
                return Err(DownloadError::Cancelled);
            }
            let chunk = chunk_result.map_err(DownloadError::Network)?;
            writer.write_all(&chunk).await.map_err(DownloadError::Disk)?;
            bytes_written += chunk.len() as u64;

            gate.on_write(chunk.len() as u64, rate.as_ref()).await;
            let _ = progress_tx
                .send(Ok(ProgressEvent {
                    segment_index: 0,
                    bytes_delta: chunk.len() as u64,
                    total_bytes,
                }))
                .await;
        }

        writer.flush().await.map_err(DownloadError::Disk)?;
        let file = writer.into_inner();
        file.sync_all().await.map_err(DownloadError::Disk)?;

        Ok(bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExpectedDigest;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{header_regex, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg() -> SingleDownloaderConfig {
        SingleDownloaderConfig {
            max_bps: 0,
            resume: false,
            request_ctx: RequestContext::new("swiftget-test/1.0"),
        }
    }

    #[tokio::test]
    async fn plain_get_writes_the_whole_body() {
        let body = b"hello, single downloader".to_vec();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let transfer = Transfer {
            url: server.uri(),
            destination: dest.clone(),
            expected_digest: None,
            headers: vec![],
            user_agent: "swiftget-test/1.0".into(),
        };

        let stats = SingleDownloader::run(&transfer, &cfg(), &Client::new(), vec![], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.bytes_downloaded, body.len() as u64);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
    }

    #[tokio::test]
    async fn checksum_mismatch_surfaces_integrity_error() {
        let body = b"abc".to_vec();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let transfer = Transfer {
            url: server.uri(),
            destination: dest,
            expected_digest: Some(ExpectedDigest {
                algorithm: crate::types::ChecksumAlgorithm::Sha256,
                hex: "0".repeat(64),
            }),
            headers: vec![],
            user_agent: "swiftget-test/1.0".into(),
        };

        let err = SingleDownloader::run(&transfer, &cfg(), &Client::new(), vec![], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IntegrityMismatch { .. }));
    }

    #[tokio::test]
    async fn resume_appends_from_existing_size() {
        let full = b"0123456789".to_vec();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_regex("Range", "^bytes=5-$"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(full[5..].to_vec())
                    .insert_header("Content-Range", "bytes 5-9/10"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        tokio::fs::write(&dest, &full[..5]).await.unwrap();

        let transfer = Transfer {
            url: server.uri(),
            destination: dest.clone(),
            expected_digest: None,
            headers: vec![],
            user_agent: "swiftget-test/1.0".into(),
        };
        let mut c = cfg();
        c.resume = true;

        let stats = SingleDownloader::run(&transfer, &c, &Client::new(), vec![], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.bytes_downloaded, 10);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), full);
    }
}
