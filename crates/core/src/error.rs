use thiserror::Error;

/// Closed set of error kinds that cross a module boundary and get matched on
/// by the pipeline engine and the intake API. Anything else propagates as a
/// plain `anyhow::Error` since its caller never needs to branch on it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file too large: {size} bytes exceeds {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("duration too long: {duration:.2}s exceeds {limit:.2}s limit")]
    DurationTooLong { duration: f64, limit: f64 },

    #[error("unsupported codec: {0}")]
    InvalidCodec(String),

    #[error("unsupported container: {0}")]
    InvalidContainer(String),

    #[error("video corrupted or unreadable: {0}")]
    VideoCorrupted(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("download rejected by security policy: {0}")]
    DownloadRejected(String),

    #[error("transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    InternalError(String),
}

impl PipelineError {
    /// Error kind name as it appears in API responses and webhook payloads.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::FileNotFound(_) => "file_not_found",
            PipelineError::FileTooLarge { .. } => "file_too_large",
            PipelineError::DurationTooLong { .. } => "duration_too_long",
            PipelineError::InvalidCodec(_) => "invalid_codec",
            PipelineError::InvalidContainer(_) => "invalid_container",
            PipelineError::VideoCorrupted(_) => "video_corrupted",
            PipelineError::DownloadFailed(_) => "download_failed",
            PipelineError::DownloadRejected(_) => "download_rejected",
            PipelineError::TranscodeFailed(_) => "transcode_failed",
            PipelineError::BrokerUnavailable(_) => "broker_unavailable",
            PipelineError::Unauthorized => "unauthorized",
            PipelineError::ValidationError(_) => "validation_error",
            PipelineError::RateLimited => "rate_limited",
            PipelineError::InternalError(_) => "internal_error",
        }
    }

    /// Fatal kinds abort the attempt immediately; everything else is
    /// considered partial/recoverable by the stage that raises it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::InternalError(_))
    }
}
