use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_classifier::ErrorClass;

/// A stable identifier for a transfer (one URL + destination pair).
pub type TransferId = Uuid;

/// A stable identifier for a bandwidth token issued by the broker.
pub type TokenId = Uuid;

/// Checksum algorithm accepted by `--checksum algorithm:hex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "sha1" | "sha-1" => Some(Self::Sha1),
            "sha256" | "sha-256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// The `algorithm:hex` pair parsed from the `--checksum` CLI option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedDigest {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

/// Identity and immutable parameters of one download. Mutable progress is
/// tracked separately by `TransferState` / `ProgressAggregator`.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub url: String,
    pub destination: PathBuf,
    pub expected_digest: Option<ExpectedDigest>,
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
}

/// `<dest>.part<index>` — the staging file for one segment.
pub fn part_path(dest: &Path, index: u64) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    name.push(format!(".part{}", index));
    dest.with_file_name(name)
}

/// `[start, end]` inclusive byte range of one segment. `index` is stable
/// across retries of the same segment; a redistributed segment receives a
/// fresh index outside the range handed out by the original plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl SegmentRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Redistributed,
}

/// Mutable tracking for one segment across its attempts.
#[derive(Debug, Clone)]
pub struct SegmentState {
    pub range: SegmentRange,
    pub bytes_written: u64,
    pub attempts: u32,
    pub last_error_class: Option<ErrorClass>,
    pub status: SegmentStatus,
}

impl SegmentState {
    pub fn new(range: SegmentRange) -> Self {
        Self {
            range,
            bytes_written: 0,
            attempts: 0,
            last_error_class: None,
            status: SegmentStatus::Pending,
        }
    }

    /// Reset for a fresh attempt — the part file is truncated separately by
    /// the caller before this is invoked.
    pub fn reset_for_retry(&mut self) {
        self.bytes_written = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Fairness weight used by the broker when distributing budget.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Low => 0.3,
            Priority::Normal => 0.6,
            Priority::High => 0.8,
            Priority::Critical => 1.0,
        }
    }
}

/// Who is asking for bandwidth — multiplies the priority weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestorKind {
    UserInitiated,
    Background,
    System,
}

impl RequestorKind {
    pub fn multiplier(self) -> f64 {
        match self {
            RequestorKind::UserInitiated => 1.5,
            RequestorKind::Background => 2.0 / 3.0,
            RequestorKind::System => 2.0,
        }
    }
}

/// A bandwidth allocation record issued by `BandwidthBroker`. Transfers hold
/// only the `id`; the broker owns the live record.
#[derive(Debug, Clone)]
pub struct BandwidthToken {
    pub id: TokenId,
    pub transfer_id: TransferId,
    pub allocated_bps: u64,
    pub priority: Priority,
    pub last_reported_bps: u64,
    pub allocation_time: Instant,
    pub expiration: Option<Instant>,
}

/// Known reverse-proxy / CDN / LB types the Segmenter uses to cap
/// concurrent range connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHint {
    Nginx,
    Apache,
    Cdn,
    CloudLoadBalancer,
}

impl ServerHint {
    pub fn connection_ceiling(self) -> usize {
        match self {
            ServerHint::Nginx => 8,
            ServerHint::Apache => 6,
            ServerHint::Cdn => 10,
            ServerHint::CloudLoadBalancer => 12,
        }
    }

    /// Best-effort detection from a `Server:` response header.
    pub fn detect(server_header: &str) -> Option<Self> {
        let s = server_header.to_ascii_lowercase();
        if s.contains("nginx") {
            Some(ServerHint::Nginx)
        } else if s.contains("apache") {
            Some(ServerHint::Apache)
        } else if s.contains("cloudflare") || s.contains("cloudfront") || s.contains("akamai") || s.contains("fastly") {
            Some(ServerHint::Cdn)
        } else if s.contains("awselb") || s.contains("gws") || s.contains("azure") {
            Some(ServerHint::CloudLoadBalancer)
        } else {
            None
        }
    }
}

/// What the HEAD probe learned about the server.
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilities {
    pub accepts_ranges: bool,
    pub content_length: Option<u64>,
    pub server_hint: Option<ServerHint>,
    /// Filename parsed out of a `Content-Disposition` response header, if
    /// the server sent one.
    pub suggested_filename: Option<String>,
}

/// A measured throughput sample, used by the Segmenter to re-size segments
/// on subsequent transfers of similar files.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputSample {
    pub bytes_per_sec: f64,
}

/// Derived, never-persisted aggregate.
#[derive(Debug, Clone, Default)]
pub struct DownloadStats {
    pub bytes_downloaded: u64,
    pub instantaneous_bps: f64,
    pub peak_bps: f64,
    pub avg_bps: f64,
    pub eta_secs: Option<f64>,
    pub segments_completed: usize,
    pub segments_total: usize,
}

/// Request headers and auth/proxy parameters shared by every request a
/// transfer issues (HEAD probe, segment GETs, single-connection GET).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub headers: HashMap<String, String>,
    pub proxy: Option<String>,
    pub verify_tls: bool,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub max_redirects: usize,
}

impl RequestContext {
    pub fn new(user_agent: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), user_agent.to_string());
        Self {
            headers,
            proxy: None,
            verify_tls: true,
            connect_timeout_secs: 30,
            response_timeout_secs: 300,
            max_redirects: 10,
        }
    }
}
