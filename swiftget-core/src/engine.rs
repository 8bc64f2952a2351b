//! Top-level entry point: one call per URL, one task per segment, a
//! structured scope per transfer. Owns the `BandwidthBroker` for the
//! lifetime of the process the same way a download manager owns its
//! notifier task — created at construction, torn down on drop — and picks
//! `MultiDownloader` or `SingleDownloader` based on what the HEAD probe
//! learned.

use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::bandwidth_broker::{AdmissionPolicy, BandwidthBroker, BandwidthBrokerHandle};
use crate::config::TransferConfig;
use crate::error::{DownloadError, EngineError};
use crate::error_classifier::{classify, ClassifyContext};
use crate::multi_downloader::{MultiDownloader, MultiDownloaderConfig};
use crate::probe;
use crate::progress::ProgressObserver;
use crate::single_downloader::{SingleDownloader, SingleDownloaderConfig};
use crate::types::{DownloadStats, Priority, RequestContext, RequestorKind, Transfer};

pub struct EngineConfig {
    pub global_bandwidth_cap_bps: u64,
    pub admission_policy: AdmissionPolicy,
    pub fallback_threshold: f64,
    pub requestor: RequestorKind,
    pub priority: Priority,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_bandwidth_cap_bps: 0,
            admission_policy: AdmissionPolicy::Queue,
            fallback_threshold: 0.5,
            requestor: RequestorKind::UserInitiated,
            priority: Priority::Normal,
        }
    }
}

/// One engine per process: a global actor, one per process. Dropping
/// it tears down the bandwidth broker's background task.
pub struct Engine {
    cfg: EngineConfig,
    broker: BandwidthBroker,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        let broker = BandwidthBroker::spawn(cfg.global_bandwidth_cap_bps, cfg.admission_policy);
        Self { cfg, broker }
    }

    pub fn broker_handle(&self) -> BandwidthBrokerHandle {
        self.broker.handle()
    }

    /// Run one URL to completion: validate, probe, dispatch to Multi or
    /// Single, return the final stats or a classified `EngineError`.
    pub async fn download(
        &self,
        transfer_cfg: &TransferConfig,
        observers: Vec<Box<dyn ProgressObserver>>,
    ) -> Result<DownloadStats, EngineError> {
        transfer_cfg
            .validate()
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        let ctx = build_request_context(transfer_cfg);
        let client = build_client(&ctx)?;

        let caps = probe::probe(&client, &transfer_cfg.url, &ctx)
            .await
            .map_err(|err| classify_and_wrap(&err))?;

        log::info!(
            "[engine] probed {}: accepts_ranges={} content_length={:?} server_hint={:?} suggested_filename={:?}",
            transfer_cfg.url, caps.accepts_ranges, caps.content_length, caps.server_hint, caps.suggested_filename
        );

        let destination = transfer_cfg.destination_path(caps.suggested_filename.as_deref());
        let transfer = Transfer {
            url: transfer_cfg.url.clone(),
            destination,
            expected_digest: transfer_cfg.checksum.clone(),
            headers: transfer_cfg.headers.clone(),
            user_agent: transfer_cfg.user_agent.clone(),
        };

        if !caps.accepts_ranges || transfer_cfg.connections <= 1 {
            let single_cfg = SingleDownloaderConfig {
                max_bps: transfer_cfg.max_bps,
                resume: transfer_cfg.resume,
                request_ctx: ctx,
            };
            return SingleDownloader::run(&transfer, &single_cfg, &client, observers, &CancellationToken::new()).await;
        }

        let multi_cfg = MultiDownloaderConfig {
            connections: transfer_cfg.connections,
            max_bps: transfer_cfg.max_bps,
            priority: self.cfg.priority,
            requestor: self.cfg.requestor,
            fallback_threshold: self.cfg.fallback_threshold,
            resume: transfer_cfg.resume,
            request_ctx: ctx,
        };

        MultiDownloader::run(&transfer, &multi_cfg, &caps, &self.broker.handle(), &client, observers).await
    }
}

fn build_request_context(cfg: &TransferConfig) -> RequestContext {
    let mut ctx = RequestContext::new(&cfg.user_agent);
    for (key, value) in &cfg.headers {
        ctx.headers.insert(key.clone(), value.clone());
    }
    ctx.proxy = cfg.proxy.clone();
    ctx.verify_tls = cfg.verify_tls;
    ctx
}

fn build_client(ctx: &RequestContext) -> Result<Client, EngineError> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(ctx.connect_timeout_secs))
        .timeout(Duration::from_secs(ctx.response_timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(ctx.max_redirects))
        .danger_accept_invalid_certs(!ctx.verify_tls);

    if let Some(proxy_url) = &ctx.proxy {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| EngineError::Network(e.to_string()))
}

fn classify_and_wrap(err: &DownloadError) -> EngineError {
    let class = classify(err, &ClassifyContext::default());
    EngineError::from_class(class, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn single_connection_request_completes() {
        let body = b"hello from the engine".to_vec();
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", body.len().to_string()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig::default());
        let cfg = TransferConfig {
            url: server.uri(),
            destination_dir: dir.path().to_path_buf(),
            connections: 1,
            ..Default::default()
        };

        let stats = engine.download(&cfg, vec![]).await.unwrap();
        assert_eq!(stats.bytes_downloaded, body.len() as u64);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_any_request() {
        let engine = Engine::new(EngineConfig::default());
        let cfg = TransferConfig {
            url: "https://example.com/f".into(),
            connections: 0,
            ..Default::default()
        };
        let err = engine.download(&cfg, vec![]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
