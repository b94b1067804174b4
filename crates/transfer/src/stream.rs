//! Chunk bookkeeping shared by downloads and uploads.
//!
//! A stream hands out [`ChunkJob`]s, executes them without holding any
//! lock, and applies the results under its lock. Every job carries a
//! ticket; releasing a stream's in-flight set invalidates outstanding
//! tickets so late results are discarded instead of applied.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use blobxfer_protocol::{TransferProgress, TransferState, TransferType};

use crate::chunked::ChunkResult;
use crate::downloader::{InitialResponse, StreamDownloader};
use crate::error::TransferError;
use crate::planner::{ByteRange, ChunkRange};
use crate::record::TransferRecord;
use crate::state::StateEvent;
use crate::uploader::StreamUploader;

const COMMIT_KEY: u64 = u64::MAX;

/// What a job does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// First request of a download: discovers size, type and version.
    Initial(ChunkRange),
    Chunk(ChunkRange),
    /// Block-list commit of an upload.
    Commit,
}

impl JobKind {
    fn key(&self) -> u64 {
        match self {
            Self::Initial(c) | Self::Chunk(c) => c.start,
            Self::Commit => COMMIT_KEY,
        }
    }
}

/// A unit of work claimed from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkJob {
    pub ticket: u64,
    pub kind: JobKind,
}

impl ChunkJob {
    pub fn range(&self) -> Option<ByteRange> {
        match &self.kind {
            JobKind::Initial(c) | JobKind::Chunk(c) => Some(c.byte_range()),
            JobKind::Commit => None,
        }
    }
}

/// Result of executing a job, not yet applied to the record.
#[derive(Debug)]
pub enum JobOutcome {
    Initial(InitialResponse),
    Chunk(ChunkResult),
    Committed { etag: Option<String> },
}

/// Effect of applying an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub progress: TransferProgress,
    /// Nothing is left to transfer or commit.
    pub finished: bool,
}

/// Callbacks from a stream driven to completion.
pub trait StreamDelegate: Send + Sync {
    fn on_progress(&self, _progress: TransferProgress) {}
    fn on_failed(&self, _error: &TransferError) {}
    fn on_completed(&self) {}
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// A record plus the set of ranges currently being worked on.
pub(crate) struct Ledger {
    pub(crate) record: TransferRecord,
    in_flight: HashMap<u64, u64>,
    next_ticket: u64,
}

impl Ledger {
    pub(crate) fn new(record: TransferRecord) -> Self {
        Self {
            record,
            in_flight: HashMap::new(),
            next_ticket: 1,
        }
    }

    pub(crate) fn claim(&mut self, kind: JobKind) -> ChunkJob {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.in_flight.insert(kind.key(), ticket);
        ChunkJob { ticket, kind }
    }

    fn owns(&self, job: &ChunkJob) -> bool {
        self.in_flight.get(&job.kind.key()) == Some(&job.ticket)
    }

    fn release(&mut self, job: &ChunkJob) {
        if self.owns(job) {
            self.in_flight.remove(&job.kind.key());
        }
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// First pending chunk nobody is working on.
    pub(crate) fn first_idle_pending(&self) -> Option<ChunkRange> {
        self.record
            .pending_chunks
            .iter()
            .find(|c| !self.in_flight.contains_key(&c.start))
            .cloned()
    }
}

pub(crate) fn lock_ledger(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Direction-specific behavior behind [`TransferStream`].
pub(crate) trait ChunkEngine: Sync {
    fn ledger(&self) -> &Mutex<Ledger>;

    fn cancel_token(&self) -> &CancellationToken;

    /// Picks the next job kind, or `None` when nothing can start right now.
    fn plan_next(&self, ledger: &Ledger) -> Option<JobKind>;

    fn execute(
        &self,
        job: &ChunkJob,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<JobOutcome, TransferError>> + Send;

    fn apply_outcome(
        &self,
        ledger: &mut Ledger,
        job: &ChunkJob,
        outcome: JobOutcome,
    ) -> Result<(), TransferError>;

    fn is_finished_in(&self, ledger: &Ledger) -> bool;
}

// ---------------------------------------------------------------------------
// Generic driving
// ---------------------------------------------------------------------------

pub(crate) fn next_job<E: ChunkEngine>(engine: &E) -> Option<ChunkJob> {
    let mut ledger = lock_ledger(engine.ledger());
    if ledger.record.state.is_terminal() {
        return None;
    }
    let kind = engine.plan_next(&ledger)?;
    Some(ledger.claim(kind))
}

pub(crate) fn apply<E: ChunkEngine>(
    engine: &E,
    job: &ChunkJob,
    outcome: JobOutcome,
) -> Result<Option<Applied>, TransferError> {
    let mut ledger = lock_ledger(engine.ledger());
    if !ledger.owns(job) {
        debug!(ticket = job.ticket, "discarding stale chunk result");
        return Ok(None);
    }
    ledger.release(job);
    engine.apply_outcome(&mut ledger, job, outcome)?;
    Ok(Some(Applied {
        progress: ledger.record.progress(),
        finished: engine.is_finished_in(&ledger),
    }))
}

pub(crate) fn release<E: ChunkEngine>(engine: &E, job: &ChunkJob) {
    lock_ledger(engine.ledger()).release(job);
}

pub(crate) fn release_all<E: ChunkEngine>(engine: &E) {
    lock_ledger(engine.ledger()).in_flight.clear();
}

pub(crate) fn is_finished<E: ChunkEngine>(engine: &E) -> bool {
    let ledger = lock_ledger(engine.ledger());
    engine.is_finished_in(&ledger)
}

pub(crate) fn snapshot<E: ChunkEngine>(engine: &E) -> TransferRecord {
    lock_ledger(engine.ledger()).record.clone()
}

pub(crate) fn update<E: ChunkEngine, R>(engine: &E, f: impl FnOnce(&mut TransferRecord) -> R) -> R {
    f(&mut lock_ledger(engine.ledger()).record)
}

/// Executes and applies one job.
pub(crate) async fn run_job<E: ChunkEngine>(
    engine: &E,
    job: &ChunkJob,
    cancel: &CancellationToken,
) -> Result<Option<Applied>, TransferError> {
    match engine.execute(job, cancel).await {
        Ok(outcome) => apply(engine, job, outcome),
        Err(err) => {
            release(engine, job);
            Err(err)
        }
    }
}

/// Moves a standalone stream into `InProgress`.
fn begin<E: ChunkEngine>(engine: &E) -> Result<(), TransferError> {
    update(engine, |record| {
        if matches!(record.state, TransferState::Paused | TransferState::Failed) {
            record.apply_event(StateEvent::Resume {
                owner_registered: true,
            })?;
        }
        if record.state == TransferState::Pending {
            record.apply_event(StateEvent::Dispatch)?;
        }
        match record.state {
            TransferState::InProgress => Ok(()),
            state => Err(TransferError::InvalidTransition {
                state,
                action: "start",
            }),
        }
    })
}

pub(crate) async fn run_next<E: ChunkEngine>(
    engine: &E,
) -> Option<Result<TransferProgress, TransferError>> {
    if is_finished(engine) {
        return None;
    }
    if let Err(e) = begin(engine) {
        return Some(Err(e));
    }
    let job = next_job(engine)?;
    let result = run_job(engine, &job, engine.cancel_token()).await;
    Some(match result {
        Ok(Some(applied)) => {
            if applied.finished {
                let _ = update(engine, |record| record.apply_event(StateEvent::Finish));
            }
            Ok(applied.progress)
        }
        Ok(None) => Err(TransferError::Cancelled),
        Err(e) => Err(e),
    })
}

/// Drains every remaining job with at most `concurrency` in flight.
///
/// After the first failure no new jobs start; in-flight ones are allowed
/// to finish and their results are still applied.
pub(crate) async fn run_to_completion<E: ChunkEngine>(
    engine: &E,
    concurrency: usize,
    delegate: Option<&dyn StreamDelegate>,
) -> Result<(), TransferError> {
    if snapshot(engine).state == TransferState::Complete {
        if let Some(d) = delegate {
            d.on_completed();
        }
        return Ok(());
    }
    begin(engine)?;

    let cancel = engine.cancel_token();
    let limit = concurrency.max(1);
    let mut running = FuturesUnordered::new();
    let mut failure: Option<TransferError> = None;

    loop {
        while failure.is_none() && running.len() < limit {
            let Some(job) = next_job(engine) else {
                break;
            };
            running.push(async move {
                let result = run_job(engine, &job, cancel).await;
                (job, result)
            });
        }
        let Some((job, result)) = running.next().await else {
            break;
        };
        match result {
            Ok(Some(applied)) => {
                if let Some(d) = delegate {
                    d.on_progress(applied.progress);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(range = ?job.range(), error = %e, "chunk failed");
                failure.get_or_insert(e);
            }
        }
    }

    let failure = match failure {
        Some(e) => Some(e),
        None if !is_finished(engine) => Some(TransferError::Cancelled),
        None => None,
    };

    if let Some(err) = failure {
        update(engine, |record| {
            record.note_error(&err);
            let event = match err {
                TransferError::Cancelled => StateEvent::Cancel,
                _ => StateEvent::Fail,
            };
            let _ = record.apply_event(event);
        });
        if let Some(d) = delegate {
            d.on_failed(&err);
        }
        return Err(err);
    }

    update(engine, |record| record.apply_event(StateEvent::Finish))?;
    if let Some(d) = delegate {
        d.on_completed();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TransferStream
// ---------------------------------------------------------------------------

/// A download or upload, driven job by job.
pub enum TransferStream {
    Download(StreamDownloader),
    Upload(StreamUploader),
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $body:expr) => {
        match $self {
            TransferStream::Download($s) => $body,
            TransferStream::Upload($s) => $body,
        }
    };
}

impl TransferStream {
    pub fn id(&self) -> Uuid {
        self.update(|r| r.id)
    }

    pub fn transfer_type(&self) -> TransferType {
        match self {
            Self::Download(_) => TransferType::Download,
            Self::Upload(_) => TransferType::Upload,
        }
    }

    pub fn snapshot(&self) -> TransferRecord {
        dispatch!(self, s => snapshot(s))
    }

    /// Mutates the record under the stream's lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut TransferRecord) -> R) -> R {
        dispatch!(self, s => update(s, f))
    }

    /// Claims the next job, if one can start.
    pub fn next_job(&self) -> Option<ChunkJob> {
        dispatch!(self, s => next_job(s))
    }

    pub async fn execute(
        &self,
        job: &ChunkJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, TransferError> {
        match self {
            Self::Download(s) => s.execute(job, cancel).await,
            Self::Upload(s) => s.execute(job, cancel).await,
        }
    }

    /// Applies an outcome. `Ok(None)` means the job was stale and ignored.
    pub fn apply(
        &self,
        job: &ChunkJob,
        outcome: JobOutcome,
    ) -> Result<Option<Applied>, TransferError> {
        dispatch!(self, s => apply(s, job, outcome))
    }

    /// Returns a failed job's range to the pending pool.
    pub fn release(&self, job: &ChunkJob) {
        dispatch!(self, s => release(s, job))
    }

    /// Forgets every in-flight job; their results will be discarded.
    pub fn release_all(&self) {
        dispatch!(self, s => release_all(s))
    }

    pub fn in_flight(&self) -> usize {
        dispatch!(self, s => lock_ledger(s.ledger()).in_flight_len())
    }

    pub fn is_finished(&self) -> bool {
        dispatch!(self, s => is_finished(s))
    }
}

impl From<StreamDownloader> for TransferStream {
    fn from(s: StreamDownloader) -> Self {
        Self::Download(s)
    }
}

impl From<StreamUploader> for TransferStream {
    fn from(s: StreamUploader) -> Self {
        Self::Upload(s)
    }
}
