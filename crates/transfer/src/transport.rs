use std::future::Future;
use std::pin::Pin;

use blobxfer_protocol::{HttpRequest, HttpResponse};

/// Failure to obtain any HTTP response at all.
///
/// Non-2xx responses are not transport errors; they come back as an
/// [`HttpResponse`] and are classified by the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Other(String),
}

/// Boxed future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;

/// Sends HTTP requests to the storage service.
///
/// Uses boxed futures so the trait stays object-safe and can be shared as
/// `Arc<dyn Transport>` across chunk workers.
pub trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_>;
}
