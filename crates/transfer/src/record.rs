//! The persisted state of one transfer.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use blobxfer_protocol::{TransferProgress, TransferState, TransferType};

use crate::blocks::BlockIndexMap;
use crate::error::TransferError;
use crate::planner::{ByteRange, ChunkRange};
use crate::state::{StateEvent, transition};

/// Direction-specific part of a [`TransferRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Direction {
    Download(DownloadDetails),
    Upload(UploadDetails),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadDetails {
    pub source_url: String,
    pub destination: PathBuf,
    /// Size of the whole remote object, known after the initial request.
    pub total_size: Option<u64>,
    /// Version the transfer is pinned to with `If-Match`.
    pub etag: Option<String>,
    pub initial_request_done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDetails {
    pub source: PathBuf,
    pub destination_url: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub blocks: BlockIndexMap,
    pub committed: bool,
}

/// Everything needed to report on, and resume, one transfer.
///
/// `pending_chunks` holds every range that has not been applied yet,
/// including ranges currently in flight, so a crash never loses coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: Uuid,
    pub owner_tag: String,
    pub state: TransferState,
    pub start_range: u64,
    /// Exclusive end of the requested interval, once known.
    pub end_range: Option<u64>,
    pub progress_bytes: u64,
    pub chunk_size: u64,
    pub pending_chunks: Vec<ChunkRange>,
    pub completed_chunks: Vec<ByteRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub fatal: bool,
    /// Consecutive retryable failures since the last successful chunk.
    #[serde(default)]
    pub attempts: u32,
    /// Paused by the network monitor rather than by the caller.
    #[serde(default)]
    pub paused_by_network: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub direction: Direction,
}

impl TransferRecord {
    pub fn new_download(
        owner_tag: impl Into<String>,
        source_url: impl Into<String>,
        destination: impl Into<PathBuf>,
        start_range: u64,
        end_range: Option<u64>,
        chunk_size: u64,
    ) -> Self {
        Self::new(
            owner_tag.into(),
            start_range,
            end_range,
            chunk_size,
            Direction::Download(DownloadDetails {
                source_url: source_url.into(),
                destination: destination.into(),
                total_size: None,
                etag: None,
                initial_request_done: false,
            }),
        )
    }

    pub fn new_upload(
        owner_tag: impl Into<String>,
        source: impl Into<PathBuf>,
        destination_url: impl Into<String>,
        file_size: u64,
        chunk_size: u64,
        content_type: Option<String>,
    ) -> Self {
        Self::new(
            owner_tag.into(),
            0,
            Some(file_size),
            chunk_size,
            Direction::Upload(UploadDetails {
                source: source.into(),
                destination_url: destination_url.into(),
                file_size,
                content_type,
                blocks: BlockIndexMap::default(),
                committed: false,
            }),
        )
    }

    fn new(
        owner_tag: String,
        start_range: u64,
        end_range: Option<u64>,
        chunk_size: u64,
        direction: Direction,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_tag,
            state: TransferState::Pending,
            start_range,
            end_range,
            progress_bytes: 0,
            chunk_size,
            pending_chunks: Vec::new(),
            completed_chunks: Vec::new(),
            error: None,
            fatal: false,
            attempts: 0,
            paused_by_network: false,
            created_at: now,
            updated_at: now,
            direction,
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match self.direction {
            Direction::Download(_) => TransferType::Download,
            Direction::Upload(_) => TransferType::Upload,
        }
    }

    /// Where bytes come from: a URL for downloads, a path for uploads.
    pub fn source(&self) -> String {
        match &self.direction {
            Direction::Download(d) => d.source_url.clone(),
            Direction::Upload(u) => u.source.display().to_string(),
        }
    }

    pub fn destination(&self) -> String {
        match &self.direction {
            Direction::Download(d) => d.destination.display().to_string(),
            Direction::Upload(u) => u.destination_url.clone(),
        }
    }

    /// `end_range - start_range`, once the end is known.
    pub fn requested_size(&self) -> Option<u64> {
        self.end_range.map(|end| end.saturating_sub(self.start_range))
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress::new(self.progress_bytes, self.requested_size().unwrap_or(0))
    }

    /// All requested bytes are accounted for.
    pub fn is_complete(&self) -> bool {
        self.requested_size() == Some(self.progress_bytes)
    }

    pub fn download(&self) -> Option<&DownloadDetails> {
        match &self.direction {
            Direction::Download(d) => Some(d),
            Direction::Upload(_) => None,
        }
    }

    pub fn upload(&self) -> Option<&UploadDetails> {
        match &self.direction {
            Direction::Upload(u) => Some(u),
            Direction::Download(_) => None,
        }
    }

    pub(crate) fn download_mut(&mut self) -> Option<&mut DownloadDetails> {
        match &mut self.direction {
            Direction::Download(d) => Some(d),
            Direction::Upload(_) => None,
        }
    }

    pub(crate) fn upload_mut(&mut self) -> Option<&mut UploadDetails> {
        match &mut self.direction {
            Direction::Upload(u) => Some(u),
            Direction::Download(_) => None,
        }
    }

    /// Applies a lifecycle event, updating `state` and `updated_at`.
    pub fn apply_event(&mut self, event: StateEvent) -> Result<TransferState, TransferError> {
        let next = transition(self.state, event)?;
        self.state = next;
        self.touch();
        Ok(next)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Moves a finished chunk from pending to completed and counts its bytes.
    ///
    /// `received` may be shorter than the planned chunk only when it is the
    /// provisional first chunk of a download of unknown size.
    pub(crate) fn record_chunk(
        &mut self,
        planned: &ChunkRange,
        received: ByteRange,
    ) -> Result<(), TransferError> {
        if self.state.is_terminal() {
            return Err(TransferError::InvalidTransition {
                state: self.state,
                action: "apply a chunk to",
            });
        }
        let new_progress = self.progress_bytes + received.len();
        if let Some(requested) = self.requested_size() {
            if new_progress > requested {
                return Err(TransferError::Planning(format!(
                    "chunk {received} would bring progress to {new_progress} of {requested} bytes"
                )));
            }
        }
        self.pending_chunks.retain(|c| c.start != planned.start);
        if !received.is_empty() {
            self.completed_chunks.push(received);
        }
        self.progress_bytes = new_progress;
        self.attempts = 0;
        self.error = None;
        self.touch();
        Ok(())
    }

    /// Records a failure message without changing state.
    pub fn note_error(&mut self, error: &TransferError) {
        self.error = Some(error.to_string());
        if error.is_fatal() {
            self.fatal = true;
        }
        self.touch();
    }
}
