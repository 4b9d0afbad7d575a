use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Everything that can go wrong between an inbound snapshot batch and
/// the remote ingestion endpoint.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unsupported frame format: {0}")]
    UnsupportedFormat(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("frame is {got_width}x{got_height} but the track is {track_width}x{track_height}")]
    DimensionMismatch {
        track_width: u32,
        track_height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("frame queue is closed")]
    QueueClosed,

    #[error("projector is already running")]
    AlreadyRunning,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("upload not acknowledged within {0} ms")]
    Timeout(u64),
}

impl StreamError {
    /// Stable tag for logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::Decode(_) => "decode",
            StreamError::UnsupportedFormat(_) => "unsupported_format",
            StreamError::Encode(_) => "encode",
            StreamError::DimensionMismatch { .. } => "dimension_mismatch",
            StreamError::QueueClosed => "queue_closed",
            StreamError::AlreadyRunning => "already_running",
            StreamError::IllegalState(_) => "illegal_state",
            StreamError::UploadFailed(_) => "upload_failed",
            StreamError::Timeout(_) => "timeout",
        }
    }

    /// Per-frame faults the pipeline skips over; everything else ends
    /// the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamError::Decode(_) | StreamError::UnsupportedFormat(_)
        )
    }
}
