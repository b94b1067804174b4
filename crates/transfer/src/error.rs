//! Error taxonomy for the transfer engine.

use std::path::PathBuf;

use blobxfer_protocol::{ProtocolError, TransferState};

use crate::planner::ByteRange;
use crate::transport::TransportError;

/// Coarse classification used by retry and failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Integrity,
    FileSystem,
    UnsupportedType,
    UnownedTransfer,
    DuplicateOwner,
    Planning,
    SourceModified,
    Http,
    Protocol,
    Cancelled,
    InvalidTransition,
    NotFound,
    Store,
}

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("network error{}: {message}", at(.range))]
    Network {
        range: Option<ByteRange>,
        message: String,
    },

    #[error("integrity check failed for range {range}: expected MD5 {expected}, got {actual}")]
    Integrity {
        range: ByteRange,
        expected: String,
        actual: String,
    },

    #[error("file error on {}: {source}", .path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported object type: {0}")]
    UnsupportedType(String),

    #[error("no registered owner for transfer owner tag {owner:?}")]
    UnownedTransfer { owner: String },

    #[error("an owner with restoration id {0:?} is already registered")]
    DuplicateOwner(String),

    #[error("invalid transfer request: {0}")]
    Planning(String),

    #[error("source was modified during the transfer{}", at(.range))]
    SourceModified { range: Option<ByteRange> },

    #[error("unexpected HTTP status {status}{}", at(.range))]
    Http {
        range: Option<ByteRange>,
        status: u16,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("cancelled")]
    Cancelled,

    #[error("cannot {action} a transfer in state {state}")]
    InvalidTransition {
        state: TransferState,
        action: &'static str,
    },

    #[error("upload has {completed} of {planned} blocks staged; cannot commit")]
    IncompleteBlockList { completed: usize, planned: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("record store error: {0}")]
    Store(String),
}

fn at(range: &Option<ByteRange>) -> String {
    match range {
        Some(r) => format!(" (range {r})"),
        None => String::new(),
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::FileSystem { .. } => ErrorKind::FileSystem,
            Self::UnsupportedType(_) => ErrorKind::UnsupportedType,
            Self::UnownedTransfer { .. } => ErrorKind::UnownedTransfer,
            Self::DuplicateOwner(_) => ErrorKind::DuplicateOwner,
            Self::Planning(_) | Self::IncompleteBlockList { .. } => ErrorKind::Planning,
            Self::SourceModified { .. } => ErrorKind::SourceModified,
            Self::Http { .. } => ErrorKind::Http,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// Whether the manager may retry the failed chunk.
    ///
    /// Integrity failures are retried by re-fetching the chunk, never by
    /// reusing the received bytes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Integrity { .. } => true,
            Self::Http { status, .. } => is_transient_status(*status),
            _ => false,
        }
    }

    /// A failure that no amount of retrying or resuming can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedType(_))
    }

    /// Attaches a chunk range to errors that carry one and lack it.
    pub fn with_range(mut self, chunk: ByteRange) -> Self {
        match &mut self {
            Self::Network { range, .. }
            | Self::SourceModified { range }
            | Self::Http { range, .. } => {
                range.get_or_insert(chunk);
            }
            _ => {}
        }
        self
    }

    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }
}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> Self {
        Self::Network {
            range: None,
            message: e.to_string(),
        }
    }
}

/// HTTP statuses worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let net = TransferError::Network {
            range: None,
            message: "reset".into(),
        };
        assert!(net.is_retryable());
        assert_eq!(net.kind(), ErrorKind::Network);

        let integrity = TransferError::Integrity {
            range: ByteRange::new(0, 10),
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(integrity.is_retryable());

        assert!(
            TransferError::Http {
                range: None,
                status: 503
            }
            .is_retryable()
        );
        assert!(
            !TransferError::Http {
                range: None,
                status: 404
            }
            .is_retryable()
        );
        assert!(!TransferError::UnsupportedType("PageBlob".into()).is_retryable());
        assert!(TransferError::UnsupportedType("PageBlob".into()).is_fatal());
        assert!(!TransferError::SourceModified { range: None }.is_retryable());
    }

    #[test]
    fn with_range_fills_missing_context() {
        let err = TransferError::from(TransportError::Timeout).with_range(ByteRange::new(4, 8));
        let msg = err.to_string();
        assert!(msg.contains("range 4..8"), "{msg}");
    }

    #[test]
    fn with_range_keeps_existing_context() {
        let err = TransferError::Http {
            range: Some(ByteRange::new(0, 1)),
            status: 500,
        }
        .with_range(ByteRange::new(4, 8));
        assert!(err.to_string().contains("range 0..1"));
    }

    #[test]
    fn file_error_names_path() {
        let err = TransferError::file(
            "/tmp/x.bin",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::FileSystem);
        assert!(err.to_string().contains("/tmp/x.bin"));
    }
}
