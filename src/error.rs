//! Error types for Kairo

use thiserror::Error;

/// Result type alias for Kairo operations
pub type Result<T> = std::result::Result<T, KairoError>;

/// Kairo error types
#[derive(Error, Debug)]
pub enum KairoError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Compressed payload ended before the closing marker
    #[error("truncated block payload")]
    Truncated,

    /// Compressed payload is too short to carry a header
    #[error("bad block header")]
    BadHeader,

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Cold-store read or write failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// RPC transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the stream; a clean end, not a failure
    #[error("stream closed by peer")]
    StreamClosed,

    /// Operation ran past its deadline
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Write-ahead log failure
    #[error("WAL error: {0}")]
    Wal(String),
}

impl KairoError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KairoError::Io(_) | KairoError::Persistence(_) | KairoError::Transport(_)
        )
    }

    /// Check if error indicates a corrupt payload
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            KairoError::Truncated
                | KairoError::BadHeader
                | KairoError::ChecksumMismatch { .. }
        )
    }
}
