//! The CLI edge contract: a validated configuration record the engine
//! accepts from whatever argument parser the caller uses. Validation
//! failures map to exit code 2 (argument/validation error);
//! everything else the engine surfaces is a per-URL `EngineError` (exit 1).

use std::path::PathBuf;

use crate::types::{ChecksumAlgorithm, ExpectedDigest};

pub const MAX_CONNECTIONS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("connections must be in [1, {MAX_CONNECTIONS}], got {0}")]
    InvalidConnections(usize),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid checksum format '{0}', expected algorithm:hex")]
    InvalidChecksumFormat(String),

    #[error("unknown checksum algorithm '{0}'")]
    UnknownAlgorithm(String),
}

/// One download request as handed to `Engine::download`.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub url: String,
    pub destination_dir: PathBuf,
    pub filename_override: Option<String>,
    pub connections: usize,
    pub max_bps: u64,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub proxy: Option<String>,
    pub checksum: Option<ExpectedDigest>,
    pub resume: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub show_progress: bool,
    pub verify_tls: bool,
    pub extract_after: bool,
    pub reveal_after: bool,
}

impl TransferConfig {
    /// Parse the `algorithm:hex` form of `--checksum`.
    pub fn parse_checksum(spec: &str) -> Result<ExpectedDigest, ConfigError> {
        let (algo, hex) = spec
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidChecksumFormat(spec.to_string()))?;
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidChecksumFormat(spec.to_string()));
        }
        let algorithm =
            ChecksumAlgorithm::parse(algo).ok_or_else(|| ConfigError::UnknownAlgorithm(algo.to_string()))?;
        Ok(ExpectedDigest {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Reject N ≤ 0 (and above the documented ceiling), invalid URL,
    /// invalid checksum format, unknown algorithm.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections == 0 || self.connections > MAX_CONNECTIONS {
            return Err(ConfigError::InvalidConnections(self.connections));
        }
        reqwest::Url::parse(&self.url).map_err(|_| ConfigError::InvalidUrl(self.url.clone()))?;
        Ok(())
    }

    /// Where the final file lands: `destination_dir` joined with, in order
    /// of precedence, `--output`, the server's `Content-Disposition`
    /// filename, or the last path segment of the URL.
    pub fn destination_path(&self, server_filename: Option<&str>) -> PathBuf {
        let name = self
            .filename_override
            .clone()
            .or_else(|| server_filename.and_then(sanitize_server_filename))
            .unwrap_or_else(|| self.infer_filename());
        self.destination_dir.join(name)
    }

    fn infer_filename(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.path_segments().and_then(|mut s| s.next_back()).map(str::to_string))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "download".to_string())
    }
}

/// Server-supplied filenames are untrusted: keep only the final path
/// component so a malicious `Content-Disposition` can't escape
/// `destination_dir` via `../` segments or an absolute path.
fn sanitize_server_filename(name: &str) -> Option<String> {
    let file_name = std::path::Path::new(name).file_name()?.to_str()?.to_string();
    if file_name.is_empty() {
        None
    } else {
        Some(file_name)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            destination_dir: PathBuf::from("."),
            filename_override: None,
            connections: 8,
            max_bps: 0,
            user_agent: "SwiftGet/2.0.0".to_string(),
            headers: Vec::new(),
            proxy: None,
            checksum: None,
            resume: false,
            quiet: false,
            verbose: false,
            show_progress: true,
            verify_tls: true,
            extract_after: false,
            reveal_after: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_connections() {
        let cfg = TransferConfig {
            url: "https://example.com/f.zip".into(),
            connections: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConnections(0))));
    }

    #[test]
    fn rejects_connections_above_ceiling() {
        let cfg = TransferConfig {
            url: "https://example.com/f.zip".into(),
            connections: 65,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConnections(65))));
    }

    #[test]
    fn rejects_invalid_url() {
        let cfg = TransferConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn parses_valid_checksum_spec() {
        let digest = TransferConfig::parse_checksum("sha256:abc123").unwrap();
        assert_eq!(digest.algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(digest.hex, "abc123");
    }

    #[test]
    fn rejects_checksum_missing_colon() {
        assert!(matches!(
            TransferConfig::parse_checksum("deadbeef"),
            Err(ConfigError::InvalidChecksumFormat(_))
        ));
    }

    #[test]
    fn rejects_unknown_checksum_algorithm() {
        assert!(matches!(
            TransferConfig::parse_checksum("crc32:deadbeef"),
            Err(ConfigError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn infers_filename_from_url_path() {
        let cfg = TransferConfig {
            url: "https://example.com/dir/archive.tar.gz".into(),
            ..Default::default()
        };
        assert_eq!(cfg.destination_path(None), PathBuf::from("./archive.tar.gz"));
    }

    #[test]
    fn filename_override_wins() {
        let cfg = TransferConfig {
            url: "https://example.com/dir/archive.tar.gz".into(),
            filename_override: Some("renamed.bin".into()),
            ..Default::default()
        };
        assert_eq!(cfg.destination_path(Some("from-server.bin")), PathBuf::from("./renamed.bin"));
    }

    #[test]
    fn server_filename_wins_over_url_when_no_override() {
        let cfg = TransferConfig {
            url: "https://example.com/dir/archive.tar.gz".into(),
            ..Default::default()
        };
        assert_eq!(cfg.destination_path(Some("report.pdf")), PathBuf::from("./report.pdf"));
    }

    #[test]
    fn server_filename_is_sanitized_to_its_final_path_component() {
        let cfg = TransferConfig {
            url: "https://example.com/dir/archive.tar.gz".into(),
            ..Default::default()
        };
        assert_eq!(
            cfg.destination_path(Some("../../etc/passwd")),
            PathBuf::from("./passwd")
        );
    }
}
