//! `reqwest` implementation of the transfer engine's transport seam.

use blobxfer_protocol::{Headers, HttpRequest, HttpResponse, Method};
use blobxfer_transfer::error::is_transient_status;
use blobxfer_transfer::{Transport, TransportError, TransportFuture};
use tracing::{debug, warn};

use crate::retry::RetryConfig;

const USER_AGENT: &str = concat!("blobxfer/", env!("CARGO_PKG_VERSION"));

/// Errors constructing the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Sends engine requests over HTTPS, retrying connection failures and
/// transient statuses before handing a response back.
pub struct HttpTransport {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpTransport {
    pub fn new(retry: RetryConfig) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(retry.connect_timeout())
            .read_timeout(retry.read_timeout())
            .build()?;
        Ok(Self::with_client(client, retry))
    }

    /// Wraps an existing client, e.g. one with a proxy configured.
    pub fn with_client(client: reqwest::Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    async fn send_with_retry(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut attempt = 0;
        loop {
            let last = attempt >= self.retry.max_retries;
            match self.send_once(&request).await {
                Ok(response) if !last && is_transient_status(response.status) => {
                    warn!(
                        method = request.method.as_str(),
                        status = response.status,
                        attempt = attempt + 1,
                        "transient status, retrying"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) if !last && is_retryable(&e) => {
                    warn!(
                        method = request.method.as_str(),
                        error = %e,
                        attempt = attempt + 1,
                        "request failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(method(request.method), &request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
            .collect();
        let body = response.bytes().await.map_err(classify)?;
        debug!(
            method = request.method.as_str(),
            status,
            bytes = body.len(),
            "response received"
        );
        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
        Box::pin(self.send_with_retry(request))
    }
}

fn method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

fn is_retryable(err: &TransportError) -> bool {
    matches!(err, TransportError::Connect(_) | TransportError::Timeout)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..RetryConfig::default()
        }
    }

    /// Serves one canned response per connection, in order, then repeats the last.
    async fn serve(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let response = responses[n.min(responses.len() - 1)];
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => read += n,
                    }
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/c/blob"), hits)
    }

    const UNAVAILABLE: &str =
        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const PARTIAL: &str = "HTTP/1.1 206 Partial Content\r\ncontent-range: bytes 0-4/10\r\nx-ms-blob-type: BlockBlob\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello";

    #[tokio::test]
    async fn maps_response_headers_and_body() {
        let (url, _) = serve(vec![PARTIAL]).await;
        let transport = HttpTransport::new(fast_retry(0)).unwrap();
        let response = transport
            .send(HttpRequest::new(Method::Get, url).header("range", "bytes=0-4"))
            .await
            .unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(response.headers.get("Content-Range"), Some("bytes 0-4/10"));
        assert_eq!(response.headers.get("x-ms-blob-type"), Some("BlockBlob"));
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn retries_transient_status() {
        let (url, hits) = serve(vec![UNAVAILABLE, UNAVAILABLE, PARTIAL]).await;
        let transport = HttpTransport::new(fast_retry(3)).unwrap();
        let response = transport
            .send(HttpRequest::new(Method::Get, url))
            .await
            .unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_transient_status_when_retries_run_out() {
        let (url, hits) = serve(vec![UNAVAILABLE]).await;
        let transport = HttpTransport::new(fast_retry(1)).unwrap();
        let response = transport
            .send(HttpRequest::new(Method::Get, url))
            .await
            .unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connection_refused_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = HttpTransport::new(fast_retry(1)).unwrap();
        let err = transport
            .send(HttpRequest::new(Method::Get, format!("http://{addr}/c/blob")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    }

    #[test]
    fn method_mapping() {
        assert_eq!(method(Method::Put), reqwest::Method::PUT);
        assert_eq!(method(Method::Head), reqwest::Method::HEAD);
    }
}
