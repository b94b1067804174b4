//! Chunked download of one remote object into a local file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use blobxfer_protocol::http::headers;
use blobxfer_protocol::{BlobType, Headers, HttpResponse, ProtocolError, TransferProgress, parse_content_range};

use crate::DEFAULT_CHUNK_SIZE;
use crate::chunked::{ChunkResult, DownloadChunk, blocking_io, prepare_destination, status_error};
use crate::error::TransferError;
use crate::planner::{ChunkPlanner, ChunkRange, validate_range_request};
use crate::record::TransferRecord;
use crate::stream::{
    self, ChunkEngine, ChunkJob, JobKind, JobOutcome, Ledger, StreamDelegate, lock_ledger,
};
use crate::transport::Transport;

/// Options for a new download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub chunk_size: u64,
    /// First byte of the object to fetch.
    pub range_offset: u64,
    /// Bytes to fetch. `None` reads to the end of the object.
    pub range_length: Option<u64>,
    /// Explicit `If-Match` value. Defaults to the ETag seen on the first
    /// response; `"*"` disables version pinning.
    pub if_match: Option<String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            range_offset: 0,
            range_length: None,
            if_match: None,
        }
    }
}

/// Object metadata reported by the first response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    /// Size of the whole object.
    pub size: u64,
    pub blob_type: BlobType,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
}

impl BlobProperties {
    fn from_response(response: &HttpResponse) -> Result<Self, TransferError> {
        let h = &response.headers;
        let blob_type = match h.get(headers::BLOB_TYPE) {
            Some(value) => BlobType::from_header(value)
                .ok_or_else(|| TransferError::UnsupportedType(value.to_string()))?,
            None => return Err(ProtocolError::MissingHeader(headers::BLOB_TYPE).into()),
        };
        let size = match h.get(headers::CONTENT_RANGE) {
            Some(value) => parse_content_range(value)?
                .total
                .ok_or_else(|| ProtocolError::ContentRange(value.to_string()))?,
            None => response.body.len() as u64,
        };
        Ok(Self {
            size,
            blob_type,
            etag: h.get(headers::ETAG).map(str::to_string),
            content_type: h.get(headers::CONTENT_TYPE).map(str::to_string),
            last_modified: h.get(headers::LAST_MODIFIED).map(str::to_string),
        })
    }
}

/// Outcome of the first request of a download.
#[derive(Debug)]
pub struct InitialResponse {
    pub properties: BlobProperties,
    /// `None` when there were no bytes to fetch.
    pub result: Option<ChunkResult>,
}

/// Total size from a `416` response's `bytes */N` header.
fn unsatisfied_total(h: &Headers) -> Option<u64> {
    h.get(headers::CONTENT_RANGE)?
        .trim()
        .strip_prefix("bytes */")?
        .parse()
        .ok()
}

/// Downloads one object in parallel chunks.
///
/// The first request discovers the object's size, type and ETag; later
/// requests are pinned to that ETag and planned over the actual size.
pub struct StreamDownloader {
    transport: Arc<dyn Transport>,
    planner: ChunkPlanner,
    ledger: Mutex<Ledger>,
    properties: Mutex<Option<BlobProperties>>,
    cancel: CancellationToken,
}

impl StreamDownloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        owner_tag: impl Into<String>,
        source_url: impl Into<String>,
        destination: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Result<Self, TransferError> {
        validate_range_request(options.range_offset, options.range_length)?;
        let planner = ChunkPlanner::new(options.chunk_size)?;

        let mut record = TransferRecord::new_download(
            owner_tag,
            source_url,
            destination,
            options.range_offset,
            options.range_length.map(|len| options.range_offset + len),
            options.chunk_size,
        );
        record.pending_chunks = planner.plan(None, options.range_offset, options.range_length);
        if let Some(d) = record.download_mut() {
            d.etag = options.if_match;
        }
        Ok(Self::with_record(transport, planner, record))
    }

    /// Rebuilds a downloader from a persisted record.
    ///
    /// If bytes were already written but the destination file has since
    /// disappeared, the download starts over.
    pub fn from_record(
        transport: Arc<dyn Transport>,
        mut record: TransferRecord,
    ) -> Result<Self, TransferError> {
        let planner = ChunkPlanner::new(record.chunk_size)?;
        let Some(details) = record.download() else {
            return Err(TransferError::Planning(format!(
                "transfer {} is not a download",
                record.id
            )));
        };
        if details.initial_request_done && !details.destination.exists() && record.progress_bytes > 0
        {
            info!(transfer = %record.id, "destination missing, restarting download");
            let length = record.requested_size();
            record.progress_bytes = 0;
            record.completed_chunks.clear();
            record.pending_chunks = planner.plan(None, record.start_range, length);
            if let Some(d) = record.download_mut() {
                d.initial_request_done = false;
                d.total_size = None;
            }
        }
        Ok(Self::with_record(transport, planner, record))
    }

    fn with_record(transport: Arc<dyn Transport>, planner: ChunkPlanner, record: TransferRecord) -> Self {
        Self {
            transport,
            planner,
            ledger: Mutex::new(Ledger::new(record)),
            properties: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// A copy of the current record.
    pub fn record(&self) -> TransferRecord {
        stream::snapshot(self)
    }

    pub fn properties(&self) -> Option<BlobProperties> {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn progress(&self) -> TransferProgress {
        lock_ledger(&self.ledger).record.progress()
    }

    /// All requested bytes have been written.
    pub fn is_complete(&self) -> bool {
        stream::is_finished(self)
    }

    /// Stops in-flight and future chunk requests.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fetches the first chunk, learning the object's size and version.
    pub async fn initial_request(&self) -> Result<BlobProperties, TransferError> {
        let job = {
            let mut ledger = lock_ledger(&self.ledger);
            if ledger.record.download().is_some_and(|d| d.initial_request_done) {
                drop(ledger);
                return self.properties().ok_or_else(|| {
                    TransferError::NotFound("blob properties of a restored download".into())
                });
            }
            match self.plan_next(&ledger) {
                Some(kind @ JobKind::Initial(_)) => ledger.claim(kind),
                _ => {
                    return Err(TransferError::Planning(
                        "initial request is already in flight".into(),
                    ));
                }
            }
        };
        stream::run_job(self, &job, &self.cancel).await?;
        self.properties()
            .ok_or_else(|| TransferError::NotFound("blob properties".into()))
    }

    /// Transfers the next pending chunk. `None` when nothing is left to start.
    pub async fn next(&self) -> Option<Result<TransferProgress, TransferError>> {
        stream::run_next(self).await
    }

    /// Downloads everything that remains with up to `concurrency` chunks in flight.
    pub async fn complete(
        &self,
        concurrency: usize,
        delegate: Option<&dyn StreamDelegate>,
    ) -> Result<(), TransferError> {
        stream::run_to_completion(self, concurrency, delegate).await
    }

    /// Reads back the downloaded bytes.
    pub async fn contents(&self) -> Result<Vec<u8>, TransferError> {
        let (state, destination) = {
            let ledger = lock_ledger(&self.ledger);
            let destination = ledger
                .record
                .download()
                .map(|d| d.destination.clone())
                .unwrap_or_default();
            (ledger.record.state, destination)
        };
        if !self.is_complete() {
            return Err(TransferError::InvalidTransition {
                state,
                action: "read the contents of",
            });
        }
        blocking_io(&destination, |path| std::fs::read(path)).await
    }

    fn unit(&self, chunk: ChunkRange) -> Result<DownloadChunk, TransferError> {
        let ledger = lock_ledger(&self.ledger);
        let record = &ledger.record;
        let d = record
            .download()
            .ok_or_else(|| TransferError::Planning("record is not a download".into()))?;
        Ok(DownloadChunk {
            source_url: d.source_url.clone(),
            destination: d.destination.clone(),
            base_offset: record.start_range,
            etag: d.etag.clone(),
            chunk,
        })
    }

    async fn execute_initial(
        &self,
        chunk: ChunkRange,
        cancel: &CancellationToken,
    ) -> Result<InitialResponse, TransferError> {
        let unit = self.unit(chunk)?;
        let response = unit.send(self.transport.as_ref(), cancel).await?;

        if response.status == 416 {
            let total = unsatisfied_total(&response.headers);
            if unit.chunk.start == 0 && total == Some(0) {
                let properties = BlobProperties {
                    size: 0,
                    blob_type: response
                        .headers
                        .get(headers::BLOB_TYPE)
                        .and_then(BlobType::from_header)
                        .unwrap_or(BlobType::Block),
                    etag: response.headers.get(headers::ETAG).map(str::to_string),
                    content_type: None,
                    last_modified: None,
                };
                return self.finish_empty(&unit, properties).await;
            }
            return Err(TransferError::Planning(format!(
                "range offset {} is beyond the object size {}",
                unit.chunk.start,
                total.map_or_else(|| "?".to_string(), |t| t.to_string())
            )));
        }
        if !matches!(response.status, 200 | 206) {
            return Err(status_error(response.status, Some(unit.chunk.byte_range())));
        }

        let properties = BlobProperties::from_response(&response)?;
        if properties.blob_type != BlobType::Block {
            return Err(TransferError::UnsupportedType(
                properties.blob_type.as_header().to_string(),
            ));
        }
        if properties.size == 0 {
            return self.finish_empty(&unit, properties).await;
        }

        let fetched = unit.accept(response)?;
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let requested = self.requested_len(properties.size);
        debug!(
            url = %unit.source_url,
            size = properties.size,
            requested,
            "initial response received"
        );
        blocking_io(&unit.destination, move |path| prepare_destination(path, requested)).await?;
        let result = unit.store(fetched).await?;
        Ok(InitialResponse {
            properties,
            result: Some(result),
        })
    }

    async fn finish_empty(
        &self,
        unit: &DownloadChunk,
        properties: BlobProperties,
    ) -> Result<InitialResponse, TransferError> {
        blocking_io(&unit.destination, |path| prepare_destination(path, 0)).await?;
        Ok(InitialResponse {
            properties,
            result: None,
        })
    }

    /// Bytes this download will write once the object size is known.
    fn requested_len(&self, size: u64) -> u64 {
        let ledger = lock_ledger(&self.ledger);
        let record = &ledger.record;
        let end = record.end_range.map_or(size, |end| end.min(size));
        end.saturating_sub(record.start_range)
    }
}

impl ChunkEngine for StreamDownloader {
    fn ledger(&self) -> &Mutex<Ledger> {
        &self.ledger
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn plan_next(&self, ledger: &Ledger) -> Option<JobKind> {
        let done = ledger.record.download()?.initial_request_done;
        if done {
            return ledger.first_idle_pending().map(JobKind::Chunk);
        }
        if ledger.in_flight_len() > 0 {
            return None;
        }
        ledger.record.pending_chunks.first().cloned().map(JobKind::Initial)
    }

    async fn execute(
        &self,
        job: &ChunkJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, TransferError> {
        match &job.kind {
            JobKind::Initial(chunk) => self
                .execute_initial(chunk.clone(), cancel)
                .await
                .map(JobOutcome::Initial),
            JobKind::Chunk(chunk) => {
                let unit = self.unit(chunk.clone())?;
                unit.execute(self.transport.as_ref(), cancel)
                    .await
                    .map(JobOutcome::Chunk)
            }
            JobKind::Commit => Err(TransferError::Planning("downloads have no commit".into())),
        }
    }

    fn apply_outcome(
        &self,
        ledger: &mut Ledger,
        job: &ChunkJob,
        outcome: JobOutcome,
    ) -> Result<(), TransferError> {
        let record = &mut ledger.record;
        match (outcome, &job.kind) {
            (JobOutcome::Initial(initial), JobKind::Initial(planned)) => {
                let size = initial.properties.size;
                let end = record.end_range.map_or(size, |end| end.min(size));
                record.end_range = Some(end);
                if let Some(d) = record.download_mut() {
                    d.total_size = Some(size);
                    if d.etag.is_none() {
                        d.etag = initial.properties.etag.clone();
                    }
                    d.initial_request_done = true;
                }

                let resume_at = match &initial.result {
                    Some(result) => {
                        record.record_chunk(planned, result.received)?;
                        result.received.end
                    }
                    None => {
                        record.pending_chunks.retain(|c| c.start != planned.start);
                        end
                    }
                };
                record.pending_chunks = self.planner.plan_span(resume_at, end, 1);
                *self.properties.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(initial.properties);
                Ok(())
            }
            (JobOutcome::Chunk(result), JobKind::Chunk(_)) => {
                record.record_chunk(&result.chunk, result.received)
            }
            _ => Err(TransferError::Planning(
                "outcome does not match the job it answers".into(),
            )),
        }
    }

    fn is_finished_in(&self, ledger: &Ledger) -> bool {
        ledger
            .record
            .download()
            .is_some_and(|d| d.initial_request_done)
            && ledger.record.pending_chunks.is_empty()
    }
}
