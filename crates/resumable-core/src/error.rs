//! Error types for the download engine

use resumable_types::{ByteRange, ErrorKind};
use thiserror::Error;

/// Errors that can occur while driving a transfer
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Response carries no entity tag, cannot resume safely")]
    MissingIdentity,

    #[error("Range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("Resource size is unknown: {0}")]
    UnknownSize(String),

    #[error("Malformed Content-Range header: {0}")]
    MalformedContentRange(String),

    #[error("Requested bytes {requested} but the server sent bytes {received}")]
    UnexpectedRange {
        requested: ByteRange,
        received: ByteRange,
    },

    #[error("Invalid persisted state: {0}")]
    InvalidState(String),

    #[error("Transfer is in progress but no confirmed range was stored")]
    MissingRange,

    #[error("Giving up after {attempts} consecutive failures: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("Timeout")]
    Timeout,
}

impl TransferError {
    /// How the retry policy should treat this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Network(_)
            | TransferError::Store(_)
            | TransferError::Database(_)
            | TransferError::Io(_)
            | TransferError::Timeout => ErrorKind::Transient,
            TransferError::ServerError { status, .. } => {
                if *status >= 500 || *status == 408 || *status == 429 {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            TransferError::MissingRange => ErrorKind::RestartRequired,
            _ => ErrorKind::Fatal,
        }
    }

    /// Check if this error is retryable at all
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransferError::InvalidState(_)
                | TransferError::InvalidUrl(_)
                | TransferError::InvalidHeader(_)
                | TransferError::RetriesExhausted { .. }
                | TransferError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_kinds() {
        let kind = |status| {
            TransferError::ServerError {
                status,
                message: String::new(),
            }
            .kind()
        };
        assert_eq!(kind(503), ErrorKind::Transient);
        assert_eq!(kind(429), ErrorKind::Transient);
        assert_eq!(kind(408), ErrorKind::Transient);
        assert_eq!(kind(404), ErrorKind::Fatal);
    }

    #[test]
    fn test_protocol_errors_are_fatal() {
        assert_eq!(TransferError::MissingIdentity.kind(), ErrorKind::Fatal);
        assert_eq!(
            TransferError::RangeNotSatisfiable("bytes */10".into()).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            TransferError::UnknownSize("bytes 0-9/*".into()).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            TransferError::UnexpectedRange {
                requested: ByteRange { start: 1000, end: 1999 },
                received: ByteRange { start: 0, end: 999 },
            }
            .kind(),
            ErrorKind::Fatal
        );
        assert_eq!(TransferError::MissingRange.kind(), ErrorKind::RestartRequired);
    }

    #[test]
    fn test_invalid_state_is_not_retryable() {
        assert!(!TransferError::InvalidState("progress".into()).is_retryable());
        assert!(TransferError::MissingIdentity.is_retryable());
    }
}
