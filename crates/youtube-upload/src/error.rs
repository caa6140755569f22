//! Error types for resumable uploads

/// Errors from upload operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    /// Transport failure (connect, reset, timeout). Retryable per chunk.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// 5xx from the upload endpoint. Retryable per chunk.
    #[error("upload endpoint unavailable: {0}")]
    Unavailable(String),

    /// 4xx from the upload endpoint. Fatal.
    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("upload session error: {0}")]
    Session(String),

    #[error("invalid upload response: {0}")]
    InvalidResponse(String),

    #[error("invalid video metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid uploader configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether a failed chunk may be re-sent after querying the session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Unavailable(_))
    }
}

/// Result alias for upload operations.
pub type Result<T> = std::result::Result<T, Error>;
