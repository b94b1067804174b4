//! HTTP transport for blobxfer over `reqwest`.

pub mod retry;
pub mod transport;

pub use retry::RetryConfig;
pub use transport::{HttpError, HttpTransport};
