//! Streams a file and compares its digest against an expected value.
//! Grounded in `ddm-core::checksum::sha256_path`, generalized to the closed
//! `{Md5, Sha1, Sha256}` algorithm set.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::DownloadError;
use crate::types::ChecksumAlgorithm;

const BUF_SIZE: usize = 64 * 1024;

pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Stream-hash `path` with `algorithm` and return the lowercase hex
    /// digest.
    pub async fn digest(path: &std::path::Path, algorithm: ChecksumAlgorithm) -> Result<String, DownloadError> {
        let mut file = tokio::fs::File::open(path).await.map_err(DownloadError::Disk)?;
        let mut buf = vec![0u8; BUF_SIZE];

        macro_rules! hash_with {
            ($hasher:expr) => {{
                let mut hasher = $hasher;
                loop {
                    let n = file.read(&mut buf).await.map_err(DownloadError::Disk)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hex::encode(hasher.finalize())
            }};
        }

        let digest = match algorithm {
            ChecksumAlgorithm::Md5 => hash_with!(Md5::new()),
            ChecksumAlgorithm::Sha1 => hash_with!(Sha1::new()),
            ChecksumAlgorithm::Sha256 => hash_with!(Sha256::new()),
        };

        Ok(digest)
    }

    /// Verify `path` against `expected_hex` (case-insensitive), returning
    /// `Ok(())` on match or `DownloadError::IntegrityMismatch` carrying both
    /// digests on mismatch.
    pub async fn verify(
        path: &std::path::Path,
        algorithm: ChecksumAlgorithm,
        expected_hex: &str,
    ) -> Result<(), DownloadError> {
        let actual = Self::digest(path, algorithm).await?;
        if actual.eq_ignore_ascii_case(expected_hex) {
            Ok(())
        } else {
            Err(DownloadError::IntegrityMismatch {
                expected: expected_hex.to_string(),
                actual,
            })
        }
    }
}
