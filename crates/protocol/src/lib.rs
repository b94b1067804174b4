//! Shared value types for the blob transfer engine.
//!
//! Everything here is plain data: transfer state and direction, progress,
//! network status, the HTTP request/response shapes handed to a transport,
//! and the storage service's header and body conventions.

pub mod blocks;
pub mod http;
pub mod range;
pub mod types;

pub use http::{Headers, HttpRequest, HttpResponse, Method};
pub use range::{ContentRange, format_range, parse_content_range};
pub use types::{
    BlobType, NetworkStatus, NetworkType, TransferProgress, TransferState, TransferType,
};

/// Errors produced while interpreting protocol values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unable to parse content range: {0:?}")]
    ContentRange(String),

    #[error("missing header: {0}")]
    MissingHeader(&'static str),
}
