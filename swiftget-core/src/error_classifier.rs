//! Maps raw transport/OS errors to a closed taxonomy, and decides what a
//! `MultiDownloader` should do about a failed segment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

/// The closed set of error classes. Every raw failure the downloader can
/// observe maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    TransientNetwork,
    ConnectionLost,
    ServerError,
    RateLimited,
    PartialContentError,
    CorruptedData,
    DiskSpaceError,
    PermissionDenied,
    FileExists,
    AuthRequired,
    SslError,
    DnsFailure,
    InvalidUrl,
    ProtocolUnsupported,
    NotFound,
    RedirectLoop,
    Unknown,
}

/// Per-class retry defaults: max attempts and base backoff delay.
#[derive(Debug, Clone, Copy)]
pub struct ClassPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ErrorClass {
    pub fn default_policy(self) -> ClassPolicy {
        use ErrorClass::*;
        let (max_attempts, base_ms) = match self {
            TransientNetwork => (5, 1_000),
            ConnectionLost => (5, 1_000),
            ServerError => (3, 2_000),
            RateLimited => (2, 5_000),
            PartialContentError => (3, 500),
            CorruptedData => (3, 500),
            DiskSpaceError | PermissionDenied | FileExists => (0, 0),
            AuthRequired | SslError | InvalidUrl | NotFound | ProtocolUnsupported | RedirectLoop
            | DnsFailure => (0, 0),
            Unknown => (0, 0),
        };
        ClassPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
        }
    }

    pub fn is_retryable(self) -> bool {
        self.default_policy().max_attempts > 0
    }
}

/// Outcome of classifying a fresh failure against the segment's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-issue the same range after the computed delay.
    Retry,
    /// Permanently give up on this segment; its unfinished bytes should be
    /// redistributed to other running segments.
    Redistribute,
    /// Too many segments are permanently failed — abandon the multi-
    /// connection path and fall back to a single connection.
    Fallback,
    /// Unrecoverable — cancel the whole transfer.
    Abort,
}

/// Extra context the classifier and retry policy need beyond the raw error:
/// an HTTP status (if any), a `Retry-After` value (if any), and whether the
/// response carried the wrong status for a ranged request.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub requested_range: bool,
}

/// Pure function from a raw error (+ context) to a closed `ErrorClass`.
pub fn classify(err: &DownloadError, ctx: &ClassifyContext) -> ErrorClass {
    match err {
        DownloadError::Network(e) => classify_reqwest(e, ctx),
        DownloadError::Disk(io_err) => classify_io(io_err),
        DownloadError::UnexpectedStatus { status, .. } => classify_status(*status, ctx),
        DownloadError::ShortBody { .. } => ErrorClass::PartialContentError,
        DownloadError::IntegrityMismatch { .. } => ErrorClass::CorruptedData,
        DownloadError::InvalidUrl(_) => ErrorClass::InvalidUrl,
        DownloadError::Cancelled => ErrorClass::Unknown,
        DownloadError::MaxRetryExceeded => ErrorClass::Unknown,
        DownloadError::SegmentFailed { .. } => ErrorClass::Unknown,
    }
}

fn classify_reqwest(e: &reqwest::Error, ctx: &ClassifyContext) -> ErrorClass {
    if e.is_timeout() {
        return ErrorClass::TransientNetwork;
    }
    if e.is_connect() {
        return ErrorClass::TransientNetwork;
    }
    if e.is_redirect() {
        return ErrorClass::RedirectLoop;
    }
    if let Some(status) = e.status() {
        return classify_status(status.as_u16(), ctx);
    }
    if e.is_request() || e.is_body() || e.is_decode() {
        return ErrorClass::ConnectionLost;
    }
    ErrorClass::TransientNetwork
}

fn classify_status(status: u16, ctx: &ClassifyContext) -> ErrorClass {
    match status {
        200 if ctx.requested_range => ErrorClass::PartialContentError,
        206 => ErrorClass::Unknown, // success path never reaches the classifier
        401 | 403 => ErrorClass::AuthRequired,
        404 => ErrorClass::NotFound,
        429 => ErrorClass::RateLimited,
        503 if ctx.retry_after.is_some() => ErrorClass::RateLimited,
        500..=599 => ErrorClass::ServerError,
        _ => ErrorClass::Unknown,
    }
}

fn classify_io(err: &std::io::Error) -> ErrorClass {
    use std::io::ErrorKind::*;
    match err.kind() {
        PermissionDenied => ErrorClass::PermissionDenied,
        AlreadyExists => ErrorClass::FileExists,
        OutOfMemory => ErrorClass::DiskSpaceError,
        _ => {
            // `StorageFull` is only stable on some platforms; match by raw OS
            // error code as a fallback (ENOSPC = 28).
            if err.raw_os_error() == Some(28) {
                ErrorClass::DiskSpaceError
            } else {
                ErrorClass::Unknown
            }
        }
    }
}

/// Consult the classifier and the segment's attempt history to decide what
/// to do next. `permanently_failed_ratio` is the fraction of segments in
/// the transfer that are already `Failed`/exhausted, used for the
/// fallback threshold (trigger fallback at >= 0.5 by default).
pub fn decide(
    class: ErrorClass,
    attempts_so_far: u32,
    permanently_failed_ratio: f64,
    fallback_threshold: f64,
) -> RetryDecision {
    let policy = class.default_policy();
    if !class.is_retryable() || attempts_so_far >= policy.max_attempts {
        if matches!(
            class,
            ErrorClass::DiskSpaceError
                | ErrorClass::PermissionDenied
                | ErrorClass::FileExists
                | ErrorClass::AuthRequired
                | ErrorClass::SslError
                | ErrorClass::NotFound
                | ErrorClass::InvalidUrl
                | ErrorClass::RedirectLoop
                | ErrorClass::DnsFailure
        ) {
            return RetryDecision::Abort;
        }
        if permanently_failed_ratio >= fallback_threshold {
            return RetryDecision::Fallback;
        }
        return RetryDecision::Redistribute;
    }
    RetryDecision::Retry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_err(status: u16, retry_after_secs: Option<u64>) -> DownloadError {
        DownloadError::UnexpectedStatus {
            status,
            url: "https://example.com/f".into(),
            retry_after_secs,
        }
    }

    #[test]
    fn classifies_auth_and_not_found_statuses() {
        let ctx = ClassifyContext::default();
        assert_eq!(classify(&status_err(401, None), &ctx), ErrorClass::AuthRequired);
        assert_eq!(classify(&status_err(403, None), &ctx), ErrorClass::AuthRequired);
        assert_eq!(classify(&status_err(404, None), &ctx), ErrorClass::NotFound);
    }

    #[test]
    fn classifies_rate_limiting() {
        let ctx = ClassifyContext::default();
        assert_eq!(classify(&status_err(429, None), &ctx), ErrorClass::RateLimited);

        let ctx_with_retry_after = ClassifyContext {
            retry_after: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        assert_eq!(classify(&status_err(503, None), &ctx_with_retry_after), ErrorClass::RateLimited);
    }

    #[test]
    fn a_200_on_a_ranged_request_is_a_partial_content_error() {
        let ctx = ClassifyContext {
            requested_range: true,
            ..Default::default()
        };
        assert_eq!(classify(&status_err(200, None), &ctx), ErrorClass::PartialContentError);
    }

    #[test]
    fn server_errors_classify_as_server_error() {
        let ctx = ClassifyContext::default();
        assert_eq!(classify(&status_err(500, None), &ctx), ErrorClass::ServerError);
        assert_eq!(classify(&status_err(503, None), &ctx), ErrorClass::ServerError);
    }

    #[test]
    fn io_errors_map_to_local_failure_classes() {
        let perm = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(classify_io(&perm), ErrorClass::PermissionDenied);

        let exists = std::io::Error::from(std::io::ErrorKind::AlreadyExists);
        assert_eq!(classify_io(&exists), ErrorClass::FileExists);
    }

    #[test]
    fn integrity_mismatch_is_corrupted_data() {
        let err = DownloadError::IntegrityMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(classify(&err, &ClassifyContext::default()), ErrorClass::CorruptedData);
    }

    #[test]
    fn retryable_class_retries_until_its_attempt_ceiling_then_redistributes() {
        let class = ErrorClass::TransientNetwork;
        let max_attempts = class.default_policy().max_attempts;
        assert_eq!(decide(class, max_attempts - 1, 0.0, 0.5), RetryDecision::Retry);
        assert_eq!(decide(class, max_attempts, 0.0, 0.5), RetryDecision::Redistribute);
    }

    #[test]
    fn exhausted_segment_triggers_fallback_once_the_failure_ratio_crosses_threshold() {
        let class = ErrorClass::ServerError;
        let max_attempts = class.default_policy().max_attempts;
        assert_eq!(decide(class, max_attempts, 0.6, 0.5), RetryDecision::Fallback);
    }

    #[test]
    fn local_filesystem_classes_always_abort_instead_of_redistributing() {
        for class in [ErrorClass::DiskSpaceError, ErrorClass::PermissionDenied, ErrorClass::FileExists] {
            assert_eq!(decide(class, 1, 0.0, 0.5), RetryDecision::Abort);
        }
    }

    #[test]
    fn non_retryable_network_classes_are_never_retried() {
        assert!(!ErrorClass::AuthRequired.is_retryable());
        assert!(!ErrorClass::InvalidUrl.is_retryable());
        assert_eq!(decide(ErrorClass::AuthRequired, 1, 0.0, 0.5), RetryDecision::Abort);
    }

    #[test]
    fn unrecoverable_whole_url_failures_always_abort_instead_of_redistributing() {
        for class in [
            ErrorClass::AuthRequired,
            ErrorClass::SslError,
            ErrorClass::NotFound,
            ErrorClass::InvalidUrl,
            ErrorClass::RedirectLoop,
            ErrorClass::DnsFailure,
        ] {
            assert_eq!(decide(class, 1, 0.0, 0.5), RetryDecision::Abort);
            assert_eq!(decide(class, 1, 1.0, 0.5), RetryDecision::Abort);
        }
    }
}
