//! End-to-end coverage through `Engine::download`, exercising the probe →
//! segment-plan → parallel-fetch → assemble → verify pipeline against a
//! mock server, plus the CLI-edge validation contract.

use swiftget_core::config::TransferConfig;
use swiftget_core::engine::{Engine, EngineConfig};
use swiftget_core::{ChecksumAlgorithm, EngineError};
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn data(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

struct RangeResponder {
    body: Vec<u8>,
}

impl wiremock::Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if let Some(h) = request.headers.get("Range") {
            let s = h.to_str().unwrap_or("");
            if let Some(rest) = s.strip_prefix("bytes=") {
                let mut parts = rest.splitn(2, '-');
                let start: usize = parts.next().unwrap_or("0").parse().unwrap_or(0);
                let end: usize = parts
                    .next()
                    .filter(|s| !s.is_empty())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(self.body.len() - 1)
                    .min(self.body.len() - 1);
                return ResponseTemplate::new(206)
                    .set_body_bytes(self.body[start..=end].to_vec())
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, self.body.len()));
            }
        }
        ResponseTemplate::new(200).set_body_bytes(self.body.clone())
    }
}

async fn mount_rangeable(server: &MockServer, body: &[u8]) {
    Mock::given(method("HEAD"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .insert_header("Content-Length", body.len().to_string()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder { body: body.to_vec() })
        .mount(server)
        .await;
}

#[tokio::test]
async fn segmented_download_reassembles_and_verifies_checksum() {
    // 2 MiB crosses the 1 MiB size band, so the planner actually splits
    // this into multiple segments rather than falling back to one.
    let body = data(2 * 1024 * 1024);
    let server = MockServer::start().await;
    mount_rangeable(&server, &body).await;

    let dir = tempfile::tempdir().unwrap();
    let cfg = TransferConfig {
        url: server.uri(),
        destination_dir: dir.path().to_path_buf(),
        connections: 8,
        checksum: Some(swiftget_core::types::ExpectedDigest {
            algorithm: ChecksumAlgorithm::Sha256,
            hex: sha256_hex(&body),
        }),
        ..Default::default()
    };

    let engine = Engine::new(EngineConfig::default());
    let stats = engine.download(&cfg, vec![]).await.unwrap();

    assert_eq!(stats.bytes_downloaded, body.len() as u64);
    let written = tokio::fs::read(cfg.destination_path(None)).await.unwrap();
    assert_eq!(written, body);
}

#[tokio::test]
async fn checksum_mismatch_surfaces_as_integrity_error() {
    let body = data(512 * 1024);
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
    let cfg = TransferConfig {
        url: server.uri(),
        destination_dir: dir.path().to_path_buf(),
        connections: 1,
        checksum: Some(swiftget_core::types::ExpectedDigest {
            algorithm: ChecksumAlgorithm::Sha256,
            hex: "0".repeat(64),
        }),
        ..Default::default()
    };

    let engine = Engine::new(EngineConfig::default());
    let err = engine.download(&cfg, vec![]).await.unwrap_err();
    assert!(matches!(err, EngineError::IntegrityMismatch { .. }));
}

#[tokio::test]
async fn non_rangeable_server_falls_back_to_single_connection_through_engine() {
    let body = data(4 * 1024 * 1024);
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
    let cfg = TransferConfig {
        url: server.uri(),
        destination_dir: dir.path().to_path_buf(),
        connections: 8,
        ..Default::default()
    };

    let engine = Engine::new(EngineConfig::default());
    let stats = engine.download(&cfg, vec![]).await.unwrap();
    assert_eq!(stats.bytes_downloaded, body.len() as u64);
}

#[tokio::test]
async fn custom_headers_reach_the_server() {
    let body = data(1024);
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(header("X-Test-Token", "abc123"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", body.len().to_string()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("X-Test-Token", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cfg = TransferConfig {
        url: server.uri(),
        destination_dir: dir.path().to_path_buf(),
        connections: 1,
        headers: vec![("X-Test-Token".to_string(), "abc123".to_string())],
        ..Default::default()
    };

    let engine = Engine::new(EngineConfig::default());
    let stats = engine.download(&cfg, vec![]).await.unwrap();
    assert_eq!(stats.bytes_downloaded, body.len() as u64);
}

#[tokio::test]
async fn filename_override_is_honored_end_to_end() {
    let body = data(2048);
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
    let cfg = TransferConfig {
        url: format!("{}/archive.tar.gz", server.uri()),
        destination_dir: dir.path().to_path_buf(),
        filename_override: Some("renamed.bin".to_string()),
        connections: 1,
        ..Default::default()
    };

    let engine = Engine::new(EngineConfig::default());
    engine.download(&cfg, vec![]).await.unwrap();
    assert!(dir.path().join("renamed.bin").exists());
}

#[tokio::test]
async fn invalid_connections_rejected_before_any_network_activity() {
    let cfg = TransferConfig {
        url: "https://example.invalid/f.bin".into(),
        connections: 0,
        ..Default::default()
    };
    let engine = Engine::new(EngineConfig::default());
    let err = engine.download(&cfg, vec![]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn malformed_url_rejected_as_invalid_input() {
    let cfg = TransferConfig {
        url: "not-a-url".into(),
        ..Default::default()
    };
    let engine = Engine::new(EngineConfig::default());
    let err = engine.download(&cfg, vec![]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}
