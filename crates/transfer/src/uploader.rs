//! Block upload of one local file, committed as a block list.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use blobxfer_protocol::TransferProgress;

use crate::DEFAULT_CHUNK_SIZE;
use crate::chunked::{UploadChunk, commit_block_list};
use crate::error::TransferError;
use crate::planner::ChunkPlanner;
use crate::record::TransferRecord;
use crate::stream::{
    self, ChunkEngine, ChunkJob, JobKind, JobOutcome, Ledger, StreamDelegate, lock_ledger,
};
use crate::transport::Transport;

/// Options for a new upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: u64,
    /// Sent as `x-ms-blob-content-type` on commit.
    pub content_type: Option<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            content_type: None,
        }
    }
}

fn source_size(source: &std::path::Path) -> Result<u64, TransferError> {
    let metadata = std::fs::metadata(source).map_err(|e| TransferError::file(source, e))?;
    if !metadata.is_file() {
        return Err(TransferError::UnsupportedType(format!(
            "{} is not a regular file",
            source.display()
        )));
    }
    Ok(metadata.len())
}

/// Uploads one file as staged blocks, then commits them in planned order.
pub struct StreamUploader {
    transport: Arc<dyn Transport>,
    ledger: Mutex<Ledger>,
    cancel: CancellationToken,
}

impl StreamUploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        owner_tag: impl Into<String>,
        source: impl Into<PathBuf>,
        destination_url: impl Into<String>,
        options: UploadOptions,
    ) -> Result<Self, TransferError> {
        let source = source.into();
        let planner = ChunkPlanner::new(options.chunk_size)?;
        let file_size = source_size(&source)?;

        let (chunks, blocks) = planner.plan_upload(file_size);
        let mut record = TransferRecord::new_upload(
            owner_tag,
            source,
            destination_url,
            file_size,
            options.chunk_size,
            options.content_type,
        );
        record.pending_chunks = chunks;
        if let Some(u) = record.upload_mut() {
            u.blocks = blocks;
        }
        Ok(Self::with_record(transport, record))
    }

    /// Rebuilds an uploader from a persisted record.
    ///
    /// Fails with [`TransferError::SourceModified`] if the file size changed
    /// since the upload was planned.
    pub fn from_record(
        transport: Arc<dyn Transport>,
        record: TransferRecord,
    ) -> Result<Self, TransferError> {
        let Some(details) = record.upload() else {
            return Err(TransferError::Planning(format!(
                "transfer {} is not an upload",
                record.id
            )));
        };
        if !details.committed {
            let size = source_size(&details.source)?;
            if size != details.file_size {
                info!(
                    transfer = %record.id,
                    planned = details.file_size,
                    actual = size,
                    "upload source changed size"
                );
                return Err(TransferError::SourceModified { range: None });
            }
        }
        Ok(Self::with_record(transport, record))
    }

    fn with_record(transport: Arc<dyn Transport>, record: TransferRecord) -> Self {
        Self {
            transport,
            ledger: Mutex::new(Ledger::new(record)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn record(&self) -> TransferRecord {
        stream::snapshot(self)
    }

    pub fn progress(&self) -> TransferProgress {
        lock_ledger(&self.ledger).record.progress()
    }

    /// The block list has been committed.
    pub fn is_complete(&self) -> bool {
        stream::is_finished(self)
    }

    /// Every planned block has been staged.
    pub fn is_staged(&self) -> bool {
        lock_ledger(&self.ledger)
            .record
            .upload()
            .is_some_and(|u| u.blocks.is_fully_completed())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stages the next pending block. `None` when no block is left to start.
    ///
    /// Never commits; call [`commit`](Self::commit) once every block is staged.
    pub async fn next(&self) -> Option<Result<TransferProgress, TransferError>> {
        if self.is_staged() {
            return None;
        }
        stream::run_next(self).await
    }

    /// Stages all remaining blocks, then commits.
    pub async fn complete(
        &self,
        concurrency: usize,
        delegate: Option<&dyn StreamDelegate>,
    ) -> Result<(), TransferError> {
        stream::run_to_completion(self, concurrency, delegate).await
    }

    /// Commits the staged blocks in planned order.
    pub async fn commit(&self) -> Result<(), TransferError> {
        let job = {
            let mut ledger = lock_ledger(&self.ledger);
            match self.plan_next(&ledger) {
                Some(JobKind::Commit) => ledger.claim(JobKind::Commit),
                _ => {
                    let (completed, planned) = ledger
                        .record
                        .upload()
                        .map(|u| (u.blocks.completed_len(), u.blocks.planned_len()))
                        .unwrap_or_default();
                    return Err(TransferError::IncompleteBlockList { completed, planned });
                }
            }
        };
        stream::run_job(self, &job, &self.cancel).await?;
        stream::update(self, |record| {
            if record.state.is_active() {
                let _ = record.apply_event(crate::state::StateEvent::Finish);
            }
        });
        Ok(())
    }

    fn commit_request(&self) -> Result<(String, Vec<String>, Option<String>), TransferError> {
        let ledger = lock_ledger(&self.ledger);
        let u = ledger
            .record
            .upload()
            .ok_or_else(|| TransferError::Planning("record is not an upload".into()))?;
        Ok((
            u.destination_url.clone(),
            u.blocks.commit_order()?,
            u.content_type.clone(),
        ))
    }
}

impl ChunkEngine for StreamUploader {
    fn ledger(&self) -> &Mutex<Ledger> {
        &self.ledger
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn plan_next(&self, ledger: &Ledger) -> Option<JobKind> {
        let upload = ledger.record.upload()?;
        if upload.committed {
            return None;
        }
        if let Some(chunk) = ledger.first_idle_pending() {
            return Some(JobKind::Chunk(chunk));
        }
        let ready = ledger.record.pending_chunks.is_empty()
            && ledger.in_flight_len() == 0
            && upload.blocks.is_fully_completed();
        ready.then_some(JobKind::Commit)
    }

    async fn execute(
        &self,
        job: &ChunkJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, TransferError> {
        match &job.kind {
            JobKind::Chunk(chunk) => {
                let unit = {
                    let ledger = lock_ledger(&self.ledger);
                    let u = ledger
                        .record
                        .upload()
                        .ok_or_else(|| TransferError::Planning("record is not an upload".into()))?;
                    UploadChunk {
                        source: u.source.clone(),
                        destination_url: u.destination_url.clone(),
                        chunk: chunk.clone(),
                    }
                };
                unit.execute(self.transport.as_ref(), cancel)
                    .await
                    .map(JobOutcome::Chunk)
            }
            JobKind::Commit => {
                let (url, ids, content_type) = self.commit_request()?;
                let etag = commit_block_list(
                    self.transport.as_ref(),
                    &url,
                    &ids,
                    content_type.as_deref(),
                    cancel,
                )
                .await?;
                Ok(JobOutcome::Committed { etag })
            }
            JobKind::Initial(_) => Err(TransferError::Planning(
                "uploads have no initial request".into(),
            )),
        }
    }

    fn apply_outcome(
        &self,
        ledger: &mut Ledger,
        _job: &ChunkJob,
        outcome: JobOutcome,
    ) -> Result<(), TransferError> {
        let record = &mut ledger.record;
        match outcome {
            JobOutcome::Chunk(result) => {
                let block_id = result.chunk.block_id.clone().ok_or_else(|| {
                    TransferError::Planning("staged chunk has no block id".into())
                })?;
                record.record_chunk(&result.chunk, result.received)?;
                if let Some(u) = record.upload_mut() {
                    u.blocks.mark_completed(&block_id)?;
                }
                Ok(())
            }
            JobOutcome::Committed { .. } => {
                if let Some(u) = record.upload_mut() {
                    u.committed = true;
                }
                record.touch();
                Ok(())
            }
            JobOutcome::Initial(_) => Err(TransferError::Planning(
                "outcome does not match the job it answers".into(),
            )),
        }
    }

    fn is_finished_in(&self, ledger: &Ledger) -> bool {
        ledger.record.upload().is_some_and(|u| u.committed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::testing::MemoryBlobService;
    use blobxfer_protocol::TransferState;
    use tempfile::TempDir;

    const URL: &str = "https://acct.blob.core.windows.net/c/upload.bin";

    fn write_source(dir: &TempDir, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let path = dir.path().join("source.bin");
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    fn uploader(service: &Arc<MemoryBlobService>, source: PathBuf, chunk_size: u64) -> StreamUploader {
        StreamUploader::new(
            service.clone(),
            "tests",
            source,
            URL,
            UploadOptions {
                chunk_size,
                content_type: Some("application/octet-stream".into()),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn uploads_and_commits_in_order() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 10_000);

        let up = uploader(&service, source, 3_000);
        up.complete(4, None).await.unwrap();

        assert!(up.is_complete());
        assert_eq!(service.blob(URL).unwrap(), data);
        assert_eq!(
            service.content_type(URL).as_deref(),
            Some("application/octet-stream")
        );
        let record = up.record();
        assert_eq!(record.state, TransferState::Complete);
        assert_eq!(record.progress_bytes, 10_000);

        assert_eq!(record.completed_chunks.len(), 4);
        assert_eq!(
            service.committed_block_ids(URL),
            record.upload().unwrap().blocks.commit_order().unwrap()
        );
    }

    #[derive(Default)]
    struct Completions(AtomicU64);

    impl StreamDelegate for Completions {
        fn on_completed(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn completing_twice_sends_nothing_new() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 5_000);

        let up = uploader(&service, source, 2_000);
        let completions = Completions::default();
        up.complete(2, Some(&completions)).await.unwrap();
        let requests = service.request_count();

        up.complete(2, Some(&completions)).await.unwrap();
        assert_eq!(service.request_count(), requests);
        assert_eq!(completions.0.load(Ordering::SeqCst), 2);
        assert_eq!(service.blob(URL).unwrap(), data);
    }

    #[tokio::test]
    async fn out_of_order_completion_commits_planned_order() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 30);

        let up = uploader(&service, source, 10);
        let first_block = up.record().pending_chunks[0].block_id.clone().unwrap();
        service.delay_block(&first_block, Duration::from_millis(50));

        up.complete(3, None).await.unwrap();
        assert_eq!(service.blob(URL).unwrap(), data);
        assert_eq!(service.committed_block_ids(URL)[0], first_block);
    }

    #[tokio::test]
    async fn empty_file_commits_empty_block_list() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 0);

        let up = uploader(&service, source, 10);
        up.complete(4, None).await.unwrap();
        assert_eq!(service.blob(URL).unwrap(), Vec::<u8>::new());
        assert!(service.committed_block_ids(URL).is_empty());
        assert_eq!(service.request_count(), 1);
    }

    #[tokio::test]
    async fn commit_before_staging_is_rejected() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 25);

        let up = uploader(&service, source, 10);
        up.next().await.unwrap().unwrap();
        let err = up.commit().await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::IncompleteBlockList {
                completed: 1,
                planned: 3
            }
        ));
        assert!(service.blob(URL).is_none());

        while let Some(step) = up.next().await {
            step.unwrap();
        }
        assert!(up.is_staged());
        up.commit().await.unwrap();
        assert!(up.is_complete());
        assert_eq!(up.record().state, TransferState::Complete);
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let result = StreamUploader::new(
            service,
            "tests",
            dir.path(),
            URL,
            UploadOptions::default(),
        );
        assert!(matches!(result, Err(TransferError::UnsupportedType(_))));
    }

    #[tokio::test]
    async fn missing_source_is_a_file_error() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let result = StreamUploader::new(
            service,
            "tests",
            dir.path().join("nope.bin"),
            URL,
            UploadOptions::default(),
        );
        assert!(matches!(result, Err(TransferError::FileSystem { .. })));
    }

    #[tokio::test]
    async fn failed_block_stops_before_commit() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 20);

        let up = uploader(&service, source, 10);
        service.fail_with_statuses(&[500]);
        let err = up.complete(1, None).await.unwrap_err();
        assert!(matches!(err, TransferError::Http { status: 500, .. }));
        assert!(service.blob(URL).is_none());
        assert_eq!(up.record().state, TransferState::Failed);
    }

    #[tokio::test]
    async fn restored_upload_skips_staged_blocks() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 30);

        let up = uploader(&service, source, 10);
        up.next().await.unwrap().unwrap();
        let saved = up.record();
        drop(up);

        let before = service.request_count();
        let restored = StreamUploader::from_record(service.clone(), saved).unwrap();
        restored.complete(2, None).await.unwrap();
        assert_eq!(service.request_count() - before, 3);
        assert_eq!(service.blob(URL).unwrap(), data);
    }

    #[tokio::test]
    async fn resized_source_is_detected_on_restore() {
        let service = Arc::new(MemoryBlobService::new());
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 30);

        let up = uploader(&service, source.clone(), 10);
        let saved = up.record();
        std::fs::write(&source, b"shorter").unwrap();

        let result = StreamUploader::from_record(service, saved);
        assert!(matches!(result, Err(TransferError::SourceModified { .. })));
    }
}
