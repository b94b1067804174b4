//! Single-chunk transfer units and the positional file I/O they use.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use blobxfer_protocol::blocks::{block_list_xml, content_md5};
use blobxfer_protocol::http::{MAX_RANGE_MD5_BYTES, append_query, headers};
use blobxfer_protocol::{
    Headers, HttpRequest, HttpResponse, Method, format_range, parse_content_range,
};

use crate::error::TransferError;
use crate::planner::{ByteRange, ChunkRange};
use crate::transport::Transport;

/// Outcome of one successfully transferred chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub chunk: ChunkRange,
    /// Bytes actually moved. Equal to the chunk's range except for the
    /// provisional first chunk of a download of unknown size.
    pub received: ByteRange,
}

// ---------------------------------------------------------------------------
// Positional file I/O
// ---------------------------------------------------------------------------

/// Writes `data` at `offset`, creating the file and parent directories if needed.
///
/// Opens its own handle so concurrent chunks never share a cursor.
pub fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

/// Reads exactly `len` bytes starting at `offset`.
pub fn read_at(path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Creates (or truncates) the destination and sizes it to `len` bytes.
pub fn prepare_destination(path: &Path, len: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    file.set_len(len)?;
    Ok(())
}

/// Runs blocking file work off the async runtime, tagging errors with `path`.
pub(crate) async fn blocking_io<T, F>(path: &Path, f: F) -> Result<T, TransferError>
where
    T: Send + 'static,
    F: FnOnce(&Path) -> std::io::Result<T> + Send + 'static,
{
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || f(&owned)).await {
        Ok(result) => result.map_err(|e| TransferError::file(path, e)),
        Err(join) => Err(TransferError::file(path, std::io::Error::other(join))),
    }
}

// ---------------------------------------------------------------------------
// Response checks
// ---------------------------------------------------------------------------

/// Maps a non-success status onto the error taxonomy.
pub(crate) fn status_error(status: u16, range: Option<ByteRange>) -> TransferError {
    match status {
        412 => TransferError::SourceModified { range },
        _ => TransferError::Http { range, status },
    }
}

/// Checks a `Content-MD5` header, when present, against the received body.
pub fn verify_content_md5(
    response_headers: &Headers,
    body: &[u8],
    range: ByteRange,
) -> Result<(), TransferError> {
    let Some(expected) = response_headers.get(headers::CONTENT_MD5) else {
        return Ok(());
    };
    let actual = content_md5(body);
    if actual != expected {
        return Err(TransferError::Integrity {
            range,
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Sends `request`, giving up early if `cancel` fires.
async fn send(
    transport: &dyn Transport,
    request: HttpRequest,
    range: Option<ByteRange>,
    cancel: &CancellationToken,
) -> Result<HttpResponse, TransferError> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        result = transport.send(request) => result,
    };
    response.map_err(|e| {
        let err = TransferError::from(e);
        match range {
            Some(r) => err.with_range(r),
            None => err,
        }
    })
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// A ranged GET whose body has been validated but not yet written.
#[derive(Debug)]
pub struct FetchedRange {
    pub received: ByteRange,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Downloads one range of a remote object into the destination file.
#[derive(Debug, Clone)]
pub struct DownloadChunk {
    pub source_url: String,
    pub destination: PathBuf,
    /// Object offset that maps to byte 0 of the destination file.
    pub base_offset: u64,
    /// Pins the request to one version of the object.
    pub etag: Option<String>,
    pub chunk: ChunkRange,
}

impl DownloadChunk {
    /// Fetches, verifies and writes the chunk.
    pub async fn execute(
        &self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<ChunkResult, TransferError> {
        let response = self.send(transport, cancel).await?;
        let fetched = self.accept(response)?;
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.store(fetched).await
    }

    /// Issues the ranged GET and returns the raw response.
    pub async fn send(
        &self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransferError> {
        let range = self.chunk.byte_range();
        let mut request = HttpRequest::new(Method::Get, &self.source_url)
            .header(headers::RANGE, format_range(range.start, range.end));
        if range.len() <= MAX_RANGE_MD5_BYTES {
            request = request.header(headers::RANGE_GET_CONTENT_MD5, "true");
        }
        if let Some(etag) = &self.etag {
            request = request.header(headers::IF_MATCH, etag.clone());
        }
        debug!(url = %self.source_url, range = %range, "requesting chunk");
        send(transport, request, Some(range), cancel).await
    }

    /// Validates status, integrity and the returned span.
    pub fn accept(&self, response: HttpResponse) -> Result<FetchedRange, TransferError> {
        let planned = self.chunk.byte_range();
        if !matches!(response.status, 200 | 206) {
            return Err(status_error(response.status, Some(planned)));
        }

        let received = match response.headers.get(headers::CONTENT_RANGE) {
            Some(value) => {
                let cr = parse_content_range(value)?;
                ByteRange::new(cr.start, cr.end)
            }
            None => ByteRange::new(planned.start, planned.start + response.body.len() as u64),
        };
        if received.start != planned.start || received.end > planned.end {
            return Err(TransferError::Network {
                range: Some(planned),
                message: format!("server returned range {received}"),
            });
        }
        if response.body.len() as u64 != received.len() {
            return Err(TransferError::Network {
                range: Some(planned),
                message: format!(
                    "body has {} bytes, expected {}",
                    response.body.len(),
                    received.len()
                ),
            });
        }
        verify_content_md5(&response.headers, &response.body, received)?;

        Ok(FetchedRange {
            received,
            headers: response.headers,
            body: response.body,
        })
    }

    /// Writes a fetched range at its position in the destination file.
    pub async fn store(&self, fetched: FetchedRange) -> Result<ChunkResult, TransferError> {
        let offset = fetched.received.start - self.base_offset;
        let body = fetched.body;
        blocking_io(&self.destination, move |path| write_at(path, offset, &body)).await?;
        Ok(ChunkResult {
            chunk: self.chunk.clone(),
            received: fetched.received,
        })
    }
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Stages one block of a local file.
#[derive(Debug, Clone)]
pub struct UploadChunk {
    pub source: PathBuf,
    pub destination_url: String,
    pub chunk: ChunkRange,
}

impl UploadChunk {
    pub async fn execute(
        &self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<ChunkResult, TransferError> {
        let range = self.chunk.byte_range();
        let block_id = self.chunk.block_id.as_deref().ok_or_else(|| {
            TransferError::Planning(format!("upload chunk {range} has no block id"))
        })?;

        let (offset, len) = (range.start, range.len());
        let data = blocking_io(&self.source, move |path| read_at(path, offset, len)).await?;

        let url = append_query(
            &self.destination_url,
            &[("comp", "block"), ("blockid", block_id)],
        );
        let request = HttpRequest::new(Method::Put, url)
            .header(headers::CONTENT_MD5, content_md5(&data))
            .body(data);

        debug!(url = %self.destination_url, range = %range, block = %block_id, "staging block");
        let response = send(transport, request, Some(range), cancel).await?;
        if !response.is_success() {
            return Err(status_error(response.status, Some(range)));
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(ChunkResult {
            chunk: self.chunk.clone(),
            received: range,
        })
    }
}

/// Commits staged blocks, in the given order, as the blob's content.
///
/// Returns the new ETag when the service reports one.
pub async fn commit_block_list(
    transport: &dyn Transport,
    destination_url: &str,
    block_ids: &[String],
    content_type: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Option<String>, TransferError> {
    let url = append_query(destination_url, &[("comp", "blocklist")]);
    let body = block_list_xml(block_ids).into_bytes();
    let mut request = HttpRequest::new(Method::Put, url)
        .header(headers::CONTENT_TYPE, "application/xml")
        .header(headers::CONTENT_MD5, content_md5(&body))
        .body(body);
    if let Some(ct) = content_type {
        request = request.header(headers::BLOB_CONTENT_TYPE, ct);
    }

    debug!(url = %destination_url, blocks = block_ids.len(), "committing block list");
    let response = send(transport, request, None, cancel).await?;
    if !response.is_success() {
        return Err(status_error(response.status, None));
    }
    Ok(response.headers.get(headers::ETAG).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBlobService;
    use tempfile::TempDir;

    const URL: &str = "https://acct.blob.core.windows.net/c/blob.bin";

    fn chunk(start: u64, end: u64) -> ChunkRange {
        ChunkRange {
            start,
            end,
            block_id: None,
            sequence_index: 0,
        }
    }

    #[test]
    fn write_at_fills_positions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/out.bin");
        write_at(&path, 5, b" World").unwrap();
        write_at(&path, 0, b"Hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"Hello World");
    }

    #[test]
    fn read_at_reads_exact_span() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        assert_eq!(read_at(&path, 3, 4).unwrap(), b"3456");
        assert!(read_at(&path, 8, 4).is_err());
    }

    #[test]
    fn prepare_destination_truncates_and_sizes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, vec![7u8; 100]).unwrap();
        prepare_destination(&path, 10).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; 10]);
    }

    #[test]
    fn md5_mismatch_is_integrity_error() {
        let mut h = Headers::new();
        h.insert(headers::CONTENT_MD5, content_md5(b"expected"));
        let err = verify_content_md5(&h, b"actual", ByteRange::new(0, 6)).unwrap_err();
        assert!(matches!(err, TransferError::Integrity { .. }));
        assert!(verify_content_md5(&h, b"expected", ByteRange::new(0, 8)).is_ok());
        assert!(verify_content_md5(&Headers::new(), b"anything", ByteRange::new(0, 8)).is_ok());
    }

    #[tokio::test]
    async fn download_chunk_writes_relative_to_base() {
        let service = MemoryBlobService::new();
        service.put_blob(URL, b"abcdefghij".to_vec());
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");

        let unit = DownloadChunk {
            source_url: URL.into(),
            destination: dest.clone(),
            base_offset: 2,
            etag: None,
            chunk: chunk(4, 8),
        };
        let result = unit
            .execute(&service, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.received, ByteRange::new(4, 8));

        let written = std::fs::read(&dest).unwrap();
        assert_eq!(&written[2..6], b"efgh");

        let req = service.requests().pop().unwrap();
        assert_eq!(req.headers.get(headers::RANGE), Some("bytes=4-7"));
        assert_eq!(req.headers.get(headers::RANGE_GET_CONTENT_MD5), Some("true"));
    }

    #[tokio::test]
    async fn download_chunk_detects_corruption() {
        let service = MemoryBlobService::new();
        service.put_blob(URL, b"abcdefghij".to_vec());
        service.corrupt_next_md5(1);
        let dir = TempDir::new().unwrap();

        let unit = DownloadChunk {
            source_url: URL.into(),
            destination: dir.path().join("out.bin"),
            base_offset: 0,
            etag: None,
            chunk: chunk(0, 4),
        };
        let err = unit
            .execute(&service, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Integrity { .. }));
        assert!(!dir.path().join("out.bin").exists());
    }

    #[tokio::test]
    async fn stale_etag_is_source_modified() {
        let service = MemoryBlobService::new();
        service.put_blob(URL, b"abcdefghij".to_vec());
        let dir = TempDir::new().unwrap();

        let unit = DownloadChunk {
            source_url: URL.into(),
            destination: dir.path().join("out.bin"),
            base_offset: 0,
            etag: Some("\"stale\"".into()),
            chunk: chunk(0, 4),
        };
        let err = unit
            .execute(&service, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceModified { .. }));
    }

    #[tokio::test]
    async fn cancelled_chunk_does_not_write() {
        let service = MemoryBlobService::new();
        service.put_blob(URL, b"abcdefghij".to_vec());
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let unit = DownloadChunk {
            source_url: URL.into(),
            destination: dir.path().join("out.bin"),
            base_offset: 0,
            etag: None,
            chunk: chunk(0, 4),
        };
        let err = unit.execute(&service, &cancel).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(!dir.path().join("out.bin").exists());
    }

    #[tokio::test]
    async fn upload_chunk_stages_block_and_commit_orders_it() {
        let service = MemoryBlobService::new();
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.bin");
        std::fs::write(&src, b"0123456789").unwrap();
        let cancel = CancellationToken::new();

        let mut ids = Vec::new();
        for (i, (start, end)) in [(5u64, 10u64), (0, 5)].into_iter().enumerate() {
            let id = blobxfer_protocol::blocks::encode_block_id(&uuid::Uuid::new_v4());
            ids.push(id.clone());
            let unit = UploadChunk {
                source: src.clone(),
                destination_url: URL.into(),
                chunk: ChunkRange {
                    start,
                    end,
                    block_id: Some(id),
                    sequence_index: 1 - i,
                },
            };
            unit.execute(&service, &cancel).await.unwrap();
        }
        assert_eq!(service.blob(URL), None);

        ids.reverse();
        let etag = commit_block_list(&service, URL, &ids, Some("text/plain"), &cancel)
            .await
            .unwrap();
        assert!(etag.is_some());
        assert_eq!(service.blob(URL).unwrap(), b"0123456789");
        assert_eq!(service.committed_block_ids(URL), ids);
    }

    #[tokio::test]
    async fn upload_chunk_without_block_id_is_rejected() {
        let service = MemoryBlobService::new();
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.bin");
        std::fs::write(&src, b"0123").unwrap();
        let unit = UploadChunk {
            source: src,
            destination_url: URL.into(),
            chunk: chunk(0, 4),
        };
        let err = unit
            .execute(&service, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Planning(_)));
        assert!(service.requests().is_empty());
    }
}
