use thiserror::Error;

/// Errors produced by the download engine and its protocol strategies.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    SocketSend(String),

    #[error("receive failed: {0}")]
    SocketRecv(String),

    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("connection timed out")]
    Timeout,

    #[error("resume state is corrupt: {0}")]
    CorruptState(String),

    #[error("part {index} exhausted its retry budget")]
    FatalExhausted { index: usize },

    #[error("too many redirects")]
    RedirectLoop,

    #[error("download aborted")]
    Aborted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("state serialization failed: {0}")]
    State(#[from] serde_json::Error),
}

impl DownloadError {
    /// Whether the per-part retry path may recover from this error.
    ///
    /// Framing errors are recoverable here because during steady-state
    /// receive they indicate a broken stream, not a broken endpoint; during
    /// discovery the caller fails the run before any retry loop exists.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DownloadError::Connect(_)
                | DownloadError::SocketSend(_)
                | DownloadError::SocketRecv(_)
                | DownloadError::ProtocolFraming(_)
                | DownloadError::Timeout
                | DownloadError::Io(_)
        )
    }
}
