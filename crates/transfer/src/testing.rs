//! In-memory blob service for tests.
//!
//! Speaks the subset of the storage protocol the engine uses: ranged GETs
//! with `If-Match` and range MD5s, block staging and block-list commits.
//! Faults can be injected per request.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use percent_encoding::percent_decode_str;

use blobxfer_protocol::blocks::{content_md5, parse_block_list_xml};
use blobxfer_protocol::http::headers;
use blobxfer_protocol::{BlobType, Headers, HttpRequest, HttpResponse, Method};

use crate::transport::{Transport, TransportError, TransportFuture};

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    etag: String,
    blob_type: BlobType,
    content_type: Option<String>,
    committed_blocks: Vec<String>,
}

/// A request as the service saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body_len: usize,
}

#[derive(Default)]
struct Faults {
    transport_failures: usize,
    status_failures: Vec<u16>,
    corrupt_md5: usize,
    block_delays: HashMap<String, Duration>,
    range_delays: HashMap<u64, Duration>,
    offline: bool,
}

/// In-memory stand-in for the storage service.
#[derive(Default)]
pub struct MemoryBlobService {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    staged: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    faults: Mutex<Faults>,
    etag_counter: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn split_url(url: &str) -> (String, HashMap<String, String>) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let params = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                k.to_string(),
                percent_decode_str(v).decode_utf8_lossy().into_owned(),
            )
        })
        .collect();
    (path.to_string(), params)
}

fn parse_range_header(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        let n = self.etag_counter.fetch_add(1, Ordering::Relaxed);
        format!("\"0x8D{n:012X}\"")
    }

    /// Stores a committed block blob.
    pub fn put_blob(&self, url: &str, data: Vec<u8>) {
        self.put_blob_with_type(url, data, BlobType::Block);
    }

    pub fn put_blob_with_type(&self, url: &str, data: Vec<u8>, blob_type: BlobType) {
        let (path, _) = split_url(url);
        let etag = self.next_etag();
        lock(&self.blobs).insert(
            path,
            StoredBlob {
                data,
                etag,
                blob_type,
                content_type: None,
                committed_blocks: Vec::new(),
            },
        );
    }

    /// Committed content of a blob.
    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        let (path, _) = split_url(url);
        lock(&self.blobs).get(&path).map(|b| b.data.clone())
    }

    pub fn content_type(&self, url: &str) -> Option<String> {
        let (path, _) = split_url(url);
        lock(&self.blobs)
            .get(&path)
            .and_then(|b| b.content_type.clone())
    }

    pub fn committed_block_ids(&self, url: &str) -> Vec<String> {
        let (path, _) = split_url(url);
        lock(&self.blobs)
            .get(&path)
            .map(|b| b.committed_blocks.clone())
            .unwrap_or_default()
    }

    /// Block ids staged but not yet committed.
    pub fn staged_block_ids(&self, url: &str) -> HashSet<String> {
        let (path, _) = split_url(url);
        lock(&self.staged)
            .get(&path)
            .map(|blocks| blocks.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// The next `n` requests fail with a connection error.
    pub fn fail_next(&self, n: usize) {
        lock(&self.faults).transport_failures += n;
    }

    /// The next requests are answered with these statuses, in order.
    pub fn fail_with_statuses(&self, statuses: &[u16]) {
        lock(&self.faults).status_failures.extend_from_slice(statuses);
    }

    /// The next `n` ranged reads carry a wrong `Content-MD5`.
    pub fn corrupt_next_md5(&self, n: usize) {
        lock(&self.faults).corrupt_md5 += n;
    }

    /// Delays the response to staging `block_id`.
    pub fn delay_block(&self, block_id: &str, delay: Duration) {
        lock(&self.faults)
            .block_delays
            .insert(block_id.to_string(), delay);
    }

    /// Delays the response to ranged reads starting at `offset`.
    pub fn delay_range(&self, offset: u64, delay: Duration) {
        lock(&self.faults).range_delays.insert(offset, delay);
    }

    /// While offline every request fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.faults).offline = offline;
    }

    fn injected_failure(&self) -> Option<Result<HttpResponse, TransportError>> {
        let mut faults = lock(&self.faults);
        if faults.offline {
            return Some(Err(TransportError::Connect("network unreachable".into())));
        }
        if faults.transport_failures > 0 {
            faults.transport_failures -= 1;
            return Some(Err(TransportError::Connect("connection reset".into())));
        }
        if !faults.status_failures.is_empty() {
            let status = faults.status_failures.remove(0);
            return Some(Ok(HttpResponse::new(status)));
        }
        None
    }

    fn delay_for(&self, request: &HttpRequest, params: &HashMap<String, String>) -> Option<Duration> {
        let faults = lock(&self.faults);
        if let Some(id) = params.get("blockid") {
            return faults.block_delays.get(id).copied();
        }
        let (start, _) = parse_range_header(request.headers.get(headers::RANGE)?)?;
        faults.range_delays.get(&start).copied()
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let (path, params) = split_url(&request.url);
        match (request.method, params.get("comp").map(String::as_str)) {
            (Method::Get, None) | (Method::Head, None) => self.get(&path, request),
            (Method::Put, Some("block")) => self.stage_block(&path, &params, request),
            (Method::Put, Some("blocklist")) => self.commit(&path, request),
            _ => HttpResponse::new(400),
        }
    }

    fn get(&self, path: &str, request: &HttpRequest) -> HttpResponse {
        let blobs = lock(&self.blobs);
        let Some(blob) = blobs.get(path) else {
            return HttpResponse::new(404);
        };
        if let Some(expected) = request.headers.get(headers::IF_MATCH) {
            if expected != "*" && expected != blob.etag {
                return HttpResponse::new(412);
            }
        }

        let len = blob.data.len() as u64;
        let mut response;
        let (start, end) = match request.headers.get(headers::RANGE).and_then(parse_range_header) {
            Some((start, end_inclusive)) => {
                if start >= len {
                    let mut r = HttpResponse::new(416);
                    r.headers
                        .insert(headers::CONTENT_RANGE, format!("bytes */{len}"));
                    return r;
                }
                let end = (end_inclusive + 1).min(len);
                response = HttpResponse::new(206);
                response.headers.insert(
                    headers::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end - 1, len),
                );
                (start, end)
            }
            None => {
                response = HttpResponse::new(200);
                (0, len)
            }
        };

        let body = blob.data[start as usize..end as usize].to_vec();
        if request.headers.get(headers::RANGE_GET_CONTENT_MD5) == Some("true") {
            let mut faults = lock(&self.faults);
            let md5 = if faults.corrupt_md5 > 0 {
                faults.corrupt_md5 -= 1;
                content_md5(b"corrupted")
            } else {
                content_md5(&body)
            };
            response.headers.insert(headers::CONTENT_MD5, md5);
        }
        response.headers.insert(headers::ETAG, blob.etag.clone());
        response
            .headers
            .insert(headers::BLOB_TYPE, blob.blob_type.as_header());
        response
            .headers
            .insert(headers::CONTENT_LENGTH, body.len().to_string());
        if let Some(ct) = &blob.content_type {
            response.headers.insert(headers::CONTENT_TYPE, ct.clone());
        }
        if request.method != Method::Head {
            response.body = body;
        }
        response
    }

    fn stage_block(
        &self,
        path: &str,
        params: &HashMap<String, String>,
        request: &HttpRequest,
    ) -> HttpResponse {
        let Some(block_id) = params.get("blockid") else {
            return HttpResponse::new(400);
        };
        if let Some(md5) = request.headers.get(headers::CONTENT_MD5) {
            if md5 != content_md5(&request.body) {
                return HttpResponse::new(400);
            }
        }
        lock(&self.staged)
            .entry(path.to_string())
            .or_default()
            .insert(block_id.clone(), request.body.clone());
        HttpResponse::new(201)
    }

    fn commit(&self, path: &str, request: &HttpRequest) -> HttpResponse {
        let xml = String::from_utf8_lossy(&request.body);
        let ids = parse_block_list_xml(&xml);

        let mut staged = lock(&self.staged);
        let blocks = staged.entry(path.to_string()).or_default();
        let mut data = Vec::new();
        for id in &ids {
            match blocks.get(id) {
                Some(block) => data.extend_from_slice(block),
                None => return HttpResponse::new(400),
            }
        }
        blocks.clear();
        drop(staged);

        let etag = self.next_etag();
        lock(&self.blobs).insert(
            path.to_string(),
            StoredBlob {
                data,
                etag: etag.clone(),
                blob_type: BlobType::Block,
                content_type: request
                    .headers
                    .get(headers::BLOB_CONTENT_TYPE)
                    .map(str::to_string),
                committed_blocks: ids,
            },
        );
        let mut response = HttpResponse::new(201);
        response.headers.insert(headers::ETAG, etag);
        response
    }
}

impl Transport for MemoryBlobService {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
        Box::pin(async move {
            let (_, params) = split_url(&request.url);
            lock(&self.requests).push(RecordedRequest {
                method: request.method,
                url: request.url.clone(),
                headers: request.headers.clone(),
                body_len: request.body.len(),
            });

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay_for(&request, &params) {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(failure) = self.injected_failure() {
                return failure;
            }
            Ok(self.handle(&request))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://acct/c/b";

    #[tokio::test]
    async fn serves_ranges_with_metadata() {
        let svc = MemoryBlobService::new();
        svc.put_blob(URL, b"0123456789".to_vec());
        let resp = svc
            .send(HttpRequest::new(Method::Get, URL).header(headers::RANGE, "bytes=2-5"))
            .await
            .unwrap();
        assert_eq!(resp.status, 206);
        assert_eq!(resp.body, b"2345");
        assert_eq!(resp.headers.get(headers::CONTENT_RANGE), Some("bytes 2-5/10"));
        assert_eq!(resp.headers.get(headers::BLOB_TYPE), Some("BlockBlob"));
    }

    #[tokio::test]
    async fn range_past_end_is_416() {
        let svc = MemoryBlobService::new();
        svc.put_blob(URL, Vec::new());
        let resp = svc
            .send(HttpRequest::new(Method::Get, URL).header(headers::RANGE, "bytes=0-3"))
            .await
            .unwrap();
        assert_eq!(resp.status, 416);
        assert_eq!(resp.headers.get(headers::CONTENT_RANGE), Some("bytes */0"));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let svc = MemoryBlobService::new();
        svc.put_blob(URL, b"x".to_vec());
        svc.fail_next(1);
        svc.fail_with_statuses(&[503]);

        assert!(svc.send(HttpRequest::new(Method::Get, URL)).await.is_err());
        assert_eq!(
            svc.send(HttpRequest::new(Method::Get, URL))
                .await
                .unwrap()
                .status,
            503
        );
        assert_eq!(
            svc.send(HttpRequest::new(Method::Get, URL))
                .await
                .unwrap()
                .status,
            200
        );
        assert_eq!(svc.request_count(), 3);
    }
}
