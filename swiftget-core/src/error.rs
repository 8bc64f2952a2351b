use crate::error_classifier::ErrorClass;

/// Parses a `Retry-After` response header as a delay in seconds. Only the
/// delta-seconds form is handled; the HTTP-date form is rare enough from
/// the servers this crate targets that it's treated as absent.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()
}

/// Low-level failure from one HTTP exchange or filesystem operation. Never
/// surfaced directly to a caller of `Engine` — `ErrorClassifier` always maps
/// it to an `ErrorClass` first.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("unexpected status {status} for {url}")]
    UnexpectedStatus {
        status: u16,
        url: String,
        retry_after_secs: Option<u64>,
    },

    #[error("short body: expected {expected} bytes, got {actual}")]
    ShortBody { expected: u64, actual: u64 },

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("cancelled")]
    Cancelled,

    #[error("max retry attempts exceeded")]
    MaxRetryExceeded,

    #[error("segment {index} failed after {attempts} attempts: {cause}")]
    SegmentFailed {
        index: u64,
        attempts: u32,
        cause: String,
    },
}

/// Top-level error kinds surfaced to callers of `Engine::download`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("client error: {0}")]
    ClientStatus(String),

    #[error("authentication required")]
    Auth,

    #[error("local filesystem error: {0}")]
    LocalIo(String),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("cancelled")]
    Cancelled,

    #[error("aborted: {0}")]
    Aborted(String),
}

impl EngineError {
    /// Classify a terminal `DownloadError` + its `ErrorClass` into the
    /// top-level error taxonomy.
    pub fn from_class(class: ErrorClass, cause: &DownloadError) -> Self {
        match class {
            ErrorClass::TransientNetwork | ErrorClass::ConnectionLost | ErrorClass::DnsFailure
            | ErrorClass::SslError | ErrorClass::RedirectLoop => EngineError::Network(cause.to_string()),
            ErrorClass::ServerError | ErrorClass::PartialContentError | ErrorClass::RateLimited => {
                EngineError::Server(cause.to_string())
            }
            ErrorClass::NotFound | ErrorClass::ProtocolUnsupported => {
                EngineError::ClientStatus(cause.to_string())
            }
            ErrorClass::AuthRequired => EngineError::Auth,
            ErrorClass::DiskSpaceError | ErrorClass::PermissionDenied | ErrorClass::FileExists => {
                EngineError::LocalIo(cause.to_string())
            }
            ErrorClass::CorruptedData => EngineError::IntegrityMismatch {
                expected: String::new(),
                actual: String::new(),
            },
            ErrorClass::InvalidUrl => EngineError::InvalidInput(cause.to_string()),
            ErrorClass::Unknown => EngineError::Aborted(cause.to_string()),
        }
    }
}
