//! Chunked, resumable blob transfers.
//!
//! A transfer is planned as fixed-size byte ranges, each moved by one
//! chunk unit, with the state of the whole transfer kept in a
//! serializable [`TransferRecord`] so it can be resumed after a restart.

pub mod blocks;
pub mod chunked;
pub mod downloader;
pub mod error;
pub mod planner;
pub mod record;
pub mod state;
pub mod stream;
pub mod transport;
pub mod uploader;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use blocks::BlockIndexMap;
pub use chunked::{ChunkResult, DownloadChunk, UploadChunk};
pub use downloader::{BlobProperties, DownloadOptions, StreamDownloader};
pub use error::{ErrorKind, TransferError};
pub use planner::{ByteRange, ChunkPlanner, ChunkRange};
pub use record::{Direction, DownloadDetails, TransferRecord, UploadDetails};
pub use state::{StateEvent, transition};
pub use stream::{Applied, ChunkJob, JobKind, JobOutcome, StreamDelegate, TransferStream};
pub use transport::{Transport, TransportError, TransportFuture};
pub use uploader::{StreamUploader, UploadOptions};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of chunks in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
