//! Transfer manager owning every transfer of the process.
//!
//! A single dispatcher task hands chunk jobs to workers, at most
//! `max_concurrency` at a time across all transfers, taking one job from
//! each runnable transfer in turn. Every record change is written to the
//! store before the delegate hears about it.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use blobxfer_protocol::{NetworkStatus, TransferState, TransferType};
use blobxfer_transfer::{
    ChunkJob, DownloadOptions, JobOutcome, StateEvent, StreamDownloader, StreamUploader,
    TransferError, TransferRecord, TransferStream, UploadOptions,
};

use crate::config::ManagerConfig;
use crate::policy::TransferNetworkPolicy;
use crate::reachability::Reachability;
use crate::store::{RecordStore, StoreError};
use crate::transfer::Transfer;
use crate::types::{ClientRegistration, TransferDelegate, TransferEvent};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A transfer the manager can dispatch.
struct Entry {
    stream: TransferStream,
    /// Token of the current run. Cancelled when the transfer stops.
    run: Mutex<CancellationToken>,
    /// Earliest start of the next job after a retryable failure.
    not_before: Mutex<Option<Instant>>,
    /// Held while snapshotting and writing the record.
    checkpoint: Mutex<()>,
    /// Consecutive failed writes of the record.
    store_failures: AtomicU32,
}

impl Entry {
    fn new(stream: TransferStream) -> Self {
        Self {
            stream,
            run: Mutex::new(CancellationToken::new()),
            not_before: Mutex::new(None),
            checkpoint: Mutex::new(()),
            store_failures: AtomicU32::new(0),
        }
    }

    fn state(&self) -> TransferState {
        self.stream.update(|r| r.state)
    }

    /// Abandons in-flight jobs; their results will be discarded.
    fn stop(&self) {
        lock(&self.run).cancel();
        self.stream.release_all();
    }

    fn restart(&self) {
        *lock(&self.run) = CancellationToken::new();
        *lock(&self.not_before) = None;
    }
}

struct Dispatch {
    entry: Arc<Entry>,
    job: ChunkJob,
    token: CancellationToken,
    starting: bool,
}

enum Pick {
    Job(Dispatch),
    /// Every chunk is done but the completion is not stored yet.
    Finish(Arc<Entry>),
    /// Nothing runnable; wake up by this time at the latest.
    Idle(Option<Instant>),
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    config: ManagerConfig,
    store: Arc<dyn RecordStore>,
    reachability: Option<Reachability>,
    owners: RwLock<HashMap<String, ClientRegistration>>,
    entries: RwLock<HashMap<Uuid, Arc<Entry>>>,
    /// Round-robin dispatch order.
    order: Mutex<VecDeque<Uuid>>,
    delegate: RwLock<Option<Arc<dyn TransferDelegate>>>,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TransferEvent>>>,
    managing: AtomicBool,
    /// Cancelled by `stop_managing`; stops the dispatcher and listeners.
    session: Mutex<CancellationToken>,
    slots: Arc<Semaphore>,
    wake: Notify,
    tracker: TaskTracker,
}

impl Shared {
    fn entry(&self, id: Uuid) -> Option<Arc<Entry>> {
        read(&self.entries).get(&id).cloned()
    }

    fn all_entries(&self) -> Vec<Arc<Entry>> {
        read(&self.entries).values().cloned().collect()
    }

    fn registration(&self, owner: &str) -> Option<ClientRegistration> {
        read(&self.owners).get(owner).cloned()
    }

    fn is_registered(&self, owner: &str) -> bool {
        read(&self.owners).contains_key(owner)
    }

    fn network(&self) -> NetworkStatus {
        self.reachability
            .as_ref()
            .map_or(NetworkStatus::WifiOrEthernet, Reachability::current)
    }

    fn policy(&self, owner: &str, kind: TransferType) -> TransferNetworkPolicy {
        match self.registration(owner) {
            Some(reg) => match kind {
                TransferType::Download => reg.options.download_policy,
                TransferType::Upload => reg.options.upload_policy,
            },
            None => TransferNetworkPolicy::default(),
        }
    }

    fn entry_policy(&self, entry: &Entry) -> TransferNetworkPolicy {
        let (owner, kind) = entry
            .stream
            .update(|r| (r.owner_tag.clone(), r.transfer_type()));
        self.policy(&owner, kind)
    }

    pub(crate) fn record(&self, id: Uuid) -> Option<TransferRecord> {
        if let Some(entry) = self.entry(id) {
            let record = entry.stream.snapshot();
            return (record.state != TransferState::Deleted).then_some(record);
        }
        match self.store.get(id) {
            Ok(record) => record,
            Err(e) => {
                warn!(transfer = %id, error = %e, "failed to read record");
                None
            }
        }
    }

    /// Every known record: persisted ones, overlaid with live state.
    fn records(&self) -> Vec<TransferRecord> {
        let mut records: HashMap<Uuid, TransferRecord> = match self.store.list() {
            Ok(list) => list.into_iter().map(|r| (r.id, r)).collect(),
            Err(e) => {
                warn!(error = %e, "failed to list records");
                HashMap::new()
            }
        };
        for entry in self.all_entries() {
            let record = entry.stream.snapshot();
            if record.state != TransferState::Deleted {
                records.insert(record.id, record);
            }
        }
        let mut records: Vec<_> = records.into_values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    fn handle(self: &Arc<Self>, id: Uuid) -> Transfer {
        Transfer::new(id, self.clone())
    }

    /// Writes the entry's current record. Deleted records are never written.
    fn checkpoint(&self, entry: &Entry) -> Result<TransferRecord, StoreError> {
        let _guard = lock(&entry.checkpoint);
        let record = entry.stream.snapshot();
        if record.state != TransferState::Deleted {
            self.store.put(&record)?;
        }
        entry.store_failures.store(0, Ordering::SeqCst);
        Ok(record)
    }

    /// Applies `change` to a copy of the record and writes the copy. The
    /// live record takes the change only once the write succeeded.
    fn commit<R>(
        &self,
        entry: &Entry,
        change: impl FnOnce(&mut TransferRecord) -> Result<R, TransferError>,
    ) -> Result<(R, TransferRecord), TransferError> {
        let _guard = lock(&entry.checkpoint);
        let committed = entry.stream.update(|live| {
            let mut next = live.clone();
            let out = change(&mut next)?;
            self.store.put(&next)?;
            *live = next.clone();
            Ok::<_, TransferError>((out, next))
        });
        if committed.is_ok() {
            entry.store_failures.store(0, Ordering::SeqCst);
        }
        committed
    }

    /// Holds an entry back after its record could not be written. Nothing
    /// is reported for it until a later write succeeds.
    fn defer(&self, entry: &Entry, err: &dyn std::fmt::Display) {
        let failures = entry.store_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.config.retry.delay_for_attempt(failures);
        let at = Instant::now() + delay;
        {
            let mut not_before = lock(&entry.not_before);
            *not_before = Some(not_before.map_or(at, |cur| cur.max(at)));
        }
        warn!(
            transfer = %entry.stream.id(),
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "failed to persist record, deferring"
        );
    }

    // -- notifications ------------------------------------------------------

    fn delegate(&self) -> Option<Arc<dyn TransferDelegate>> {
        read(&self.delegate).clone()
    }

    fn notify_state(self: &Arc<Self>, record: &TransferRecord) {
        let progress = record.progress();
        let _ = self.events_tx.try_send(TransferEvent::StateChanged {
            id: record.id,
            state: record.state,
            progress,
        });
        if let Some(d) = self.delegate() {
            d.on_state_changed(&self.handle(record.id), record.state, progress);
        }
    }

    fn notify_failed(self: &Arc<Self>, record: &TransferRecord, err: &TransferError) {
        let _ = self.events_tx.try_send(TransferEvent::Failed {
            id: record.id,
            error: err.to_string(),
        });
        if let Some(d) = self.delegate() {
            d.on_failed(&self.handle(record.id), err);
        }
    }

    fn notify_completed(self: &Arc<Self>, record: &TransferRecord) {
        let _ = self
            .events_tx
            .try_send(TransferEvent::Completed { id: record.id });
        if let Some(d) = self.delegate() {
            d.on_completed(&self.handle(record.id));
        }
    }

    // -- entries ------------------------------------------------------------

    fn insert_entry(&self, stream: TransferStream) -> Arc<Entry> {
        let id = stream.id();
        let entry = Arc::new(Entry::new(stream));
        write(&self.entries).insert(id, entry.clone());
        lock(&self.order).push_back(id);
        entry
    }

    fn forget_order(&self, id: Uuid) {
        lock(&self.order).retain(|x| *x != id);
    }

    fn restore_stream(&self, record: TransferRecord) -> Result<TransferStream, TransferError> {
        let owner = record.owner_tag.clone();
        let reg = self
            .registration(&owner)
            .ok_or(TransferError::UnownedTransfer { owner })?;
        Ok(match record.transfer_type() {
            TransferType::Download => StreamDownloader::from_record(reg.transport, record)?.into(),
            TransferType::Upload => StreamUploader::from_record(reg.transport, record)?.into(),
        })
    }

    fn add_stream(self: &Arc<Self>, stream: TransferStream) -> Result<Transfer, TransferError> {
        let record = stream.snapshot();
        self.store.put(&record)?;
        let entry = self.insert_entry(stream);
        info!(
            transfer = %record.id,
            kind = %record.transfer_type(),
            source = %record.source(),
            destination = %record.destination(),
            "transfer queued"
        );
        self.notify_state(&record);
        self.schedule(&entry);
        Ok(self.handle(record.id))
    }

    /// Finishes, network-pauses or wakes the dispatcher for a runnable entry.
    fn schedule(self: &Arc<Self>, entry: &Arc<Entry>) {
        if !entry.state().is_active() {
            return;
        }
        if entry.stream.is_finished() {
            self.finish(entry);
            return;
        }
        if !self.entry_policy(entry).allows_transfer(self.network()) {
            let _ = self.pause_entry(entry, true);
            return;
        }
        self.wake.notify_one();
    }

    fn finish(self: &Arc<Self>, entry: &Arc<Entry>) {
        let record = match self.commit(entry, |r| r.apply_event(StateEvent::Finish)) {
            Ok((_, record)) => record,
            Err(TransferError::InvalidTransition { .. }) => return,
            Err(e) => {
                self.defer(entry, &e);
                return;
            }
        };
        self.forget_order(record.id);
        info!(transfer = %record.id, bytes = record.progress_bytes, "transfer completed");
        self.notify_state(&record);
        self.notify_completed(&record);
    }

    fn fail(self: &Arc<Self>, entry: &Arc<Entry>, err: TransferError) {
        let failed = self.commit(entry, |r| {
            r.note_error(&err);
            r.apply_event(StateEvent::Fail)
        });
        let record = match failed {
            Ok((_, record)) => record,
            Err(TransferError::InvalidTransition { .. }) => return,
            Err(e) => {
                self.defer(entry, &e);
                return;
            }
        };
        entry.stop();
        error!(transfer = %record.id, error = %err, "transfer failed");
        self.notify_state(&record);
        self.notify_failed(&record, &err);
    }

    fn pause_entry(
        self: &Arc<Self>,
        entry: &Arc<Entry>,
        by_network: bool,
    ) -> Result<TransferState, TransferError> {
        let (state, record) = self.commit(entry, |r| {
            let state = r.apply_event(StateEvent::Pause)?;
            r.paused_by_network = by_network;
            Ok(state)
        })?;
        entry.stop();
        info!(transfer = %record.id, by_network, "transfer paused");
        self.notify_state(&record);
        Ok(state)
    }

    /// Resumes an entry. `automatic` resumes come from the network monitor
    /// or from `start_managing`.
    fn resume_entry(
        self: &Arc<Self>,
        entry: &Arc<Entry>,
        automatic: bool,
    ) -> Result<TransferState, TransferError> {
        let (state, owner, fatal) = entry
            .stream
            .update(|r| (r.state, r.owner_tag.clone(), r.fatal));
        if fatal {
            return Err(TransferError::InvalidTransition {
                state,
                action: "resume a permanently failed",
            });
        }

        let owner_registered = self.is_registered(&owner);
        if owner_registered && !automatic {
            let policy = self.entry_policy(entry);
            if !policy.allows_transfer(self.network()) {
                debug!(transfer = %entry.stream.id(), "network disallows transfer, resume deferred");
                self.commit(entry, |r| {
                    if r.state == TransferState::Paused {
                        r.paused_by_network = true;
                    }
                    Ok(())
                })?;
                return Ok(state);
            }
        }

        let unowned = TransferError::UnownedTransfer {
            owner: owner.clone(),
        };
        let (state, record) = self.commit(entry, |r| {
            let state = r.apply_event(StateEvent::Resume { owner_registered })?;
            if owner_registered {
                r.paused_by_network = false;
                r.attempts = 0;
                r.error = None;
            } else {
                r.note_error(&unowned);
            }
            Ok(state)
        })?;

        if !owner_registered {
            warn!(transfer = %record.id, owner = %owner, "cannot resume transfer without its owner");
            self.notify_state(&record);
            self.notify_failed(&record, &unowned);
            return Err(unowned);
        }

        entry.restart();
        info!(transfer = %record.id, automatic, "transfer resumed");
        self.notify_state(&record);
        self.schedule(entry);
        Ok(state)
    }

    fn cancel_entry(self: &Arc<Self>, entry: &Arc<Entry>) -> Result<TransferState, TransferError> {
        let (state, record) = self.commit(entry, |r| r.apply_event(StateEvent::Cancel))?;
        entry.stop();
        self.forget_order(record.id);
        info!(transfer = %record.id, "transfer canceled");
        self.notify_state(&record);
        Ok(state)
    }

    /// Applies an event to a record that has no live entry.
    fn update_stored(
        self: &Arc<Self>,
        id: Uuid,
        event: StateEvent,
    ) -> Result<TransferState, TransferError> {
        let mut record = self
            .store
            .get(id)?
            .ok_or_else(|| TransferError::NotFound(format!("transfer {id}")))?;
        let state = record.apply_event(event)?;
        self.store.put(&record)?;
        self.notify_state(&record);
        Ok(state)
    }

    // -- control ------------------------------------------------------------

    pub(crate) fn pause(self: &Arc<Self>, id: Uuid) -> Result<TransferState, TransferError> {
        match self.entry(id) {
            Some(entry) => self.pause_entry(&entry, false),
            None => self.update_stored(id, StateEvent::Pause),
        }
    }

    pub(crate) fn cancel(self: &Arc<Self>, id: Uuid) -> Result<TransferState, TransferError> {
        match self.entry(id) {
            Some(entry) => self.cancel_entry(&entry),
            None => self.update_stored(id, StateEvent::Cancel),
        }
    }

    pub(crate) fn resume(self: &Arc<Self>, id: Uuid) -> Result<TransferState, TransferError> {
        if let Some(entry) = self.entry(id) {
            return self.resume_entry(&entry, false);
        }
        let mut record = self
            .store
            .get(id)?
            .ok_or_else(|| TransferError::NotFound(format!("transfer {id}")))?;
        if !record.state.is_resumable() {
            return Err(TransferError::InvalidTransition {
                state: record.state,
                action: "resume",
            });
        }
        if record.fatal {
            return Err(TransferError::InvalidTransition {
                state: record.state,
                action: "resume a permanently failed",
            });
        }
        if !self.is_registered(&record.owner_tag) {
            let err = TransferError::UnownedTransfer {
                owner: record.owner_tag.clone(),
            };
            record.apply_event(StateEvent::Fail)?;
            record.note_error(&err);
            self.store.put(&record)?;
            warn!(transfer = %id, owner = %record.owner_tag, "cannot resume transfer without its owner");
            self.notify_state(&record);
            self.notify_failed(&record, &err);
            return Err(err);
        }
        let entry = self.insert_entry(self.restore_stream(record)?);
        match entry.state() {
            TransferState::Paused | TransferState::Failed => self.resume_entry(&entry, false),
            _ => {
                let (state, record) =
                    self.commit(&entry, |r| r.apply_event(StateEvent::Restore))?;
                self.notify_state(&record);
                self.schedule(&entry);
                Ok(state)
            }
        }
    }

    pub(crate) fn remove(self: &Arc<Self>, id: Uuid) -> Result<(), TransferError> {
        let record = match self.entry(id) {
            Some(entry) => {
                let record = {
                    let _guard = lock(&entry.checkpoint);
                    self.store.delete(id)?;
                    entry.stream.update(|r| {
                        let _ = r.apply_event(StateEvent::Remove);
                        r.clone()
                    })
                };
                write(&self.entries).remove(&id);
                self.forget_order(id);
                entry.stop();
                record
            }
            None => {
                let mut record = self
                    .store
                    .get(id)?
                    .ok_or_else(|| TransferError::NotFound(format!("transfer {id}")))?;
                record.apply_event(StateEvent::Remove)?;
                self.store.delete(id)?;
                record
            }
        };
        info!(transfer = %id, "transfer removed");
        self.notify_state(&record);
        Ok(())
    }

    // -- managing -----------------------------------------------------------

    /// Rebuilds a persisted record that has no live entry.
    fn restore_record(self: &Arc<Self>, mut record: TransferRecord) {
        let id = record.id;
        if record.fatal {
            debug!(transfer = %id, "not restoring permanently failed transfer");
            return;
        }
        if !self.is_registered(&record.owner_tag) {
            let err = TransferError::UnownedTransfer {
                owner: record.owner_tag.clone(),
            };
            let message = err.to_string();
            if record.state == TransferState::Failed && record.error.as_deref() == Some(&*message) {
                return;
            }
            let _ = record.apply_event(StateEvent::Fail);
            record.note_error(&err);
            if let Err(e) = self.store.put(&record) {
                warn!(transfer = %id, error = %e, "failed to persist unowned transfer");
                return;
            }
            warn!(transfer = %id, owner = %record.owner_tag, "no registered owner for restored transfer");
            self.notify_state(&record);
            self.notify_failed(&record, &err);
            return;
        }
        let stream = match self.restore_stream(record.clone()) {
            Ok(stream) => stream,
            Err(err) => {
                record.note_error(&err);
                let _ = record.apply_event(StateEvent::Fail);
                if let Err(e) = self.store.put(&record) {
                    warn!(transfer = %id, error = %e, "failed to persist unrestorable transfer");
                    return;
                }
                error!(transfer = %id, error = %err, "failed to restore transfer");
                self.notify_state(&record);
                self.notify_failed(&record, &err);
                return;
            }
        };
        let entry = self.insert_entry(stream);
        let restored = self.commit(&entry, |r| {
            r.paused_by_network = false;
            r.attempts = 0;
            r.apply_event(StateEvent::Restore)
        });
        let record = match restored {
            Ok((_, record)) => record,
            Err(e) => {
                warn!(transfer = %id, error = %e, "failed to restore transfer state");
                return;
            }
        };
        info!(transfer = %id, progress = record.progress_bytes, "transfer restored");
        self.notify_state(&record);
        self.schedule(&entry);
    }

    fn pick(&self) -> Pick {
        let network = self.network();
        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut order = lock(&self.order);
        for _ in 0..order.len() {
            let Some(id) = order.pop_front() else {
                break;
            };
            order.push_back(id);
            let Some(entry) = self.entry(id) else {
                continue;
            };
            let (state, owner, kind) = entry
                .stream
                .update(|r| (r.state, r.owner_tag.clone(), r.transfer_type()));
            if !state.is_active() {
                continue;
            }
            if let Some(at) = *lock(&entry.not_before) {
                if at > now {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                    continue;
                }
            }
            if entry.stream.is_finished() {
                return Pick::Finish(entry);
            }
            if !self.policy(&owner, kind).allows_transfer(network) {
                continue;
            }
            let Some(job) = entry.stream.next_job() else {
                continue;
            };
            let token = lock(&entry.run).clone();
            return Pick::Job(Dispatch {
                entry,
                job,
                token,
                starting: state == TransferState::Pending,
            });
        }
        Pick::Idle(earliest)
    }

    async fn dispatch_loop(self: Arc<Self>, session: CancellationToken) {
        debug!("dispatcher started");
        loop {
            let permit = tokio::select! {
                biased;
                _ = session.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let dispatch = loop {
                match self.pick() {
                    Pick::Job(dispatch) => break dispatch,
                    Pick::Finish(entry) => self.finish(&entry),
                    Pick::Idle(deadline) => {
                        let idle = async move {
                            match deadline {
                                Some(at) => tokio::time::sleep_until(at).await,
                                None => std::future::pending::<()>().await,
                            }
                        };
                        tokio::select! {
                            biased;
                            _ = session.cancelled() => return,
                            _ = self.wake.notified() => {}
                            _ = idle => {}
                        }
                    }
                }
            };

            if dispatch.starting && !self.mark_started(&dispatch.entry) {
                dispatch.entry.stream.release(&dispatch.job);
                continue;
            }

            let shared = self.clone();
            self.tracker.spawn(async move {
                let Dispatch {
                    entry, job, token, ..
                } = dispatch;
                let result = entry.stream.execute(&job, &token).await;
                shared.on_job_done(&entry, &job, &token, result);
                drop(permit);
                shared.wake.notify_one();
            });
        }
        debug!("dispatcher stopped");
    }

    /// Returns false when the start could not be stored.
    fn mark_started(self: &Arc<Self>, entry: &Arc<Entry>) -> bool {
        match self.commit(entry, |r| r.apply_event(StateEvent::Dispatch)) {
            Ok((_, record)) => {
                info!(transfer = %record.id, "transfer started");
                self.notify_state(&record);
                true
            }
            Err(TransferError::InvalidTransition { .. }) => true,
            Err(e) => {
                self.defer(entry, &e);
                false
            }
        }
    }

    fn on_job_done(
        self: &Arc<Self>,
        entry: &Arc<Entry>,
        job: &ChunkJob,
        token: &CancellationToken,
        result: Result<JobOutcome, TransferError>,
    ) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                entry.stream.release(job);
                self.job_failed(entry, job, token, e);
                return;
            }
        };
        match entry.stream.apply(job, outcome) {
            Ok(Some(applied)) => {
                debug!(
                    transfer = %entry.stream.id(),
                    range = ?job.range(),
                    bytes = applied.progress.bytes,
                    total = applied.progress.total_bytes,
                    "chunk complete"
                );
                match self.checkpoint(entry) {
                    // An unstored completion is finished by the dispatcher.
                    Err(e) => self.defer(entry, &e),
                    Ok(_) if applied.finished => self.finish(entry),
                    Ok(record) => self.notify_state(&record),
                }
            }
            Ok(None) => {}
            Err(e) => self.job_failed(entry, job, token, e),
        }
    }

    fn job_failed(
        self: &Arc<Self>,
        entry: &Arc<Entry>,
        job: &ChunkJob,
        token: &CancellationToken,
        err: TransferError,
    ) {
        if token.is_cancelled() || !entry.state().is_active() {
            debug!(range = ?job.range(), error = %err, "discarding result of a stopped job");
            return;
        }
        let retry = &self.config.retry;
        if err.is_retryable() {
            let attempts = entry.stream.update(|r| {
                r.attempts += 1;
                r.note_error(&err);
                r.attempts
            });
            if retry.allows_retry(attempts) {
                let delay = retry.delay_for_attempt(attempts);
                *lock(&entry.not_before) = Some(Instant::now() + delay);
                if let Err(e) = self.checkpoint(entry) {
                    self.defer(entry, &e);
                }
                warn!(
                    transfer = %entry.stream.id(),
                    range = ?job.range(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "chunk failed, retrying"
                );
                return;
            }
        }
        self.fail(entry, err);
    }

    fn on_network_change(self: &Arc<Self>, status: NetworkStatus, session: &CancellationToken) {
        let mut blocked = Vec::new();
        for entry in self.all_entries() {
            let (state, by_network) = entry.stream.update(|r| (r.state, r.paused_by_network));
            let policy = self.entry_policy(&entry);
            if state == TransferState::Paused && by_network && policy.allows_auto_resume(status) {
                if let Err(e) = self.resume_entry(&entry, true) {
                    warn!(error = %e, "automatic resume failed");
                }
            } else if state.is_active() && !policy.allows_transfer(status) {
                blocked.push(entry);
            }
        }
        self.wake.notify_one();
        if blocked.is_empty() {
            return;
        }

        let grace = self.config.network_pause_grace();
        if grace.is_zero() {
            self.pause_blocked(&blocked, status);
            return;
        }
        let shared = self.clone();
        let session = session.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = session.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            shared.pause_blocked(&blocked, shared.network());
        });
    }

    fn pause_blocked(self: &Arc<Self>, blocked: &[Arc<Entry>], status: NetworkStatus) {
        for entry in blocked {
            if entry.state().is_active() && !self.entry_policy(entry).allows_transfer(status) {
                let _ = self.pause_entry(entry, true);
            }
        }
    }

    async fn watch_network(
        self: Arc<Self>,
        mut rx: watch::Receiver<NetworkStatus>,
        session: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let status = *rx.borrow_and_update();
            info!(status = ?status, "network transition");
            self.on_network_change(status, &session);
        }
    }
}

// ---------------------------------------------------------------------------
// TransferManager
// ---------------------------------------------------------------------------

/// Owns and schedules every transfer of the process.
///
/// Construct one per process and share it by reference or `Arc`.
pub struct TransferManager {
    shared: Arc<Shared>,
}

impl TransferManager {
    /// Creates a manager that treats the network as Wi-Fi or Ethernet.
    pub fn new(config: ManagerConfig, store: Arc<dyn RecordStore>) -> Self {
        Self::build(config, store, None)
    }

    /// Creates a manager gated by reachability updates.
    pub fn with_reachability(
        config: ManagerConfig,
        store: Arc<dyn RecordStore>,
        reachability: Reachability,
    ) -> Self {
        Self::build(config, store, Some(reachability))
    }

    fn build(
        config: ManagerConfig,
        store: Arc<dyn RecordStore>,
        reachability: Option<Reachability>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let slots = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                reachability,
                owners: RwLock::new(HashMap::new()),
                entries: RwLock::new(HashMap::new()),
                order: Mutex::new(VecDeque::new()),
                delegate: RwLock::new(None),
                events_tx,
                events_rx: tokio::sync::Mutex::new(Some(events_rx)),
                managing: AtomicBool::new(false),
                session: Mutex::new(CancellationToken::new()),
                slots,
                wake: Notify::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.shared.events_rx.lock().await.take()
    }

    pub fn set_delegate(&self, delegate: Arc<dyn TransferDelegate>) {
        *write(&self.shared.delegate) = Some(delegate);
    }

    /// Registers a client as an owner of transfers.
    pub fn register_owner(&self, registration: ClientRegistration) -> Result<(), TransferError> {
        let id = registration.restoration_id().to_string();
        let mut owners = write(&self.shared.owners);
        if owners.contains_key(&id) {
            return Err(TransferError::DuplicateOwner(id));
        }
        debug!(owner = %id, "owner registered");
        owners.insert(id, registration);
        Ok(())
    }

    /// Unregisters an owner. Its running transfers keep running.
    pub fn unregister_owner(&self, restoration_id: &str) -> bool {
        let removed = write(&self.shared.owners).remove(restoration_id).is_some();
        if removed {
            debug!(owner = %restoration_id, "owner unregistered");
        }
        removed
    }

    pub fn is_owner_registered(&self, restoration_id: &str) -> bool {
        self.shared.is_registered(restoration_id)
    }

    pub fn is_managing(&self) -> bool {
        self.shared.managing.load(Ordering::SeqCst)
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.shared.network()
    }

    fn owner(&self, owner: &str) -> Result<ClientRegistration, TransferError> {
        self.shared
            .registration(owner)
            .ok_or_else(|| TransferError::UnownedTransfer {
                owner: owner.to_string(),
            })
    }

    fn chunk_size(&self, requested: u64, reg: &ClientRegistration) -> u64 {
        requested
            .min(reg.options.max_chunk_size)
            .min(self.shared.config.chunk_size)
    }

    /// Queues a download.
    ///
    /// While managing on an allowed network, the first request is made
    /// before returning so an unsupported object or an unsatisfiable range
    /// fails this call instead of entering the queue.
    pub async fn download(
        &self,
        owner: &str,
        source_url: impl Into<String>,
        destination: impl Into<PathBuf>,
        mut options: DownloadOptions,
    ) -> Result<Transfer, TransferError> {
        let reg = self.owner(owner)?;
        options.chunk_size = self.chunk_size(options.chunk_size, &reg);
        let downloader =
            StreamDownloader::new(reg.transport.clone(), owner, source_url, destination, options)?;

        if self.is_managing() && reg.options.download_policy.allows_transfer(self.network_status())
        {
            match downloader.initial_request().await {
                Ok(properties) => debug!(
                    size = properties.size,
                    etag = ?properties.etag,
                    "initial request done"
                ),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => warn!(error = %e, "initial request failed, leaving it to the dispatcher"),
            }
        }
        self.shared.add_stream(downloader.into())
    }

    /// Queues an upload of a local file.
    pub async fn upload(
        &self,
        owner: &str,
        source: impl Into<PathBuf>,
        destination_url: impl Into<String>,
        mut options: UploadOptions,
    ) -> Result<Transfer, TransferError> {
        let reg = self.owner(owner)?;
        options.chunk_size = self.chunk_size(options.chunk_size, &reg);
        let source = source.into();
        let destination_url = destination_url.into();
        let transport = reg.transport.clone();
        let owner_tag = owner.to_string();
        let uploader = tokio::task::spawn_blocking(move || {
            StreamUploader::new(transport, owner_tag, source, destination_url, options)
        })
        .await
        .map_err(|e| TransferError::Planning(format!("upload planning task failed: {e}")))??;
        self.shared.add_stream(uploader.into())
    }

    /// Adopts an existing record, for example one exported from another store.
    pub fn add(&self, record: TransferRecord) -> Result<Transfer, TransferError> {
        if self.shared.entry(record.id).is_some() {
            return Err(TransferError::Planning(format!(
                "transfer {} is already managed",
                record.id
            )));
        }
        self.owner(&record.owner_tag)?;
        let stream = self.shared.restore_stream(record)?;
        self.shared.add_stream(stream)
    }

    /// Starts dispatching: restores persisted transfers, listens for
    /// network changes, and resumes every resumable transfer.
    pub async fn start_managing(&self) -> Result<(), TransferError> {
        let shared = &self.shared;
        if shared.managing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let records = match shared.store.list() {
            Ok(records) => records,
            Err(e) => {
                shared.managing.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        debug!("loaded {} record(s) from the store", records.len());

        let session = CancellationToken::new();
        *lock(&shared.session) = session.clone();
        shared.tracker.reopen();

        for record in records {
            if !record.state.is_resumable() || record.fatal {
                continue;
            }
            match shared.entry(record.id) {
                Some(entry) => {
                    if matches!(entry.state(), TransferState::Paused | TransferState::Failed) {
                        if let Err(e) = shared.resume_entry(&entry, true) {
                            warn!(transfer = %record.id, error = %e, "failed to resume transfer");
                        }
                    }
                }
                None => shared.restore_record(record),
            }
        }

        if let Some(reach) = &shared.reachability {
            let rx = reach.subscribe();
            shared
                .tracker
                .spawn(shared.clone().watch_network(rx, session.clone()));
        }
        shared
            .tracker
            .spawn(shared.clone().dispatch_loop(session));
        shared.wake.notify_one();
        info!(transfers = read(&shared.entries).len(), "managing transfers");
        Ok(())
    }

    /// Pauses every active transfer, checkpoints, and waits for in-flight
    /// chunk operations to wind down.
    pub async fn stop_managing(&self) {
        let shared = &self.shared;
        if !shared.managing.swap(false, Ordering::SeqCst) {
            return;
        }
        for entry in shared.all_entries() {
            if entry.state().is_pauseable() {
                if let Err(e) = shared.pause_entry(&entry, false) {
                    warn!(error = %e, "failed to pause transfer");
                }
            }
        }
        lock(&shared.session).cancel();
        shared.tracker.close();
        shared.tracker.wait().await;
        for entry in shared.all_entries() {
            if let Err(e) = shared.checkpoint(&entry) {
                warn!(transfer = %entry.stream.id(), error = %e, "failed to persist record");
            }
        }
        info!("stopped managing transfers");
    }

    // -- single-transfer control ---------------------------------------------

    pub fn pause(&self, id: Uuid) -> Result<TransferState, TransferError> {
        self.shared.pause(id)
    }

    pub fn resume(&self, id: Uuid) -> Result<TransferState, TransferError> {
        self.shared.resume(id)
    }

    pub fn cancel(&self, id: Uuid) -> Result<TransferState, TransferError> {
        self.shared.cancel(id)
    }

    pub fn remove(&self, id: Uuid) -> Result<(), TransferError> {
        self.shared.remove(id)
    }

    // -- bulk control ----------------------------------------------------------

    fn scoped(&self, owner: Option<&str>) -> Vec<TransferRecord> {
        self.shared
            .records()
            .into_iter()
            .filter(|r| owner.is_none_or(|o| r.owner_tag == o))
            .collect()
    }

    /// Pauses every pauseable transfer, optionally of one owner. Returns
    /// how many were paused.
    pub fn pause_all(&self, owner: Option<&str>) -> usize {
        self.scoped(owner)
            .into_iter()
            .filter(|r| r.state.is_pauseable())
            .filter(|r| self.pause(r.id).is_ok())
            .count()
    }

    pub fn resume_all(&self, owner: Option<&str>) -> usize {
        self.scoped(owner)
            .into_iter()
            .filter(|r| matches!(r.state, TransferState::Paused | TransferState::Failed))
            .filter(|r| self.resume(r.id).is_ok())
            .count()
    }

    pub fn cancel_all(&self, owner: Option<&str>) -> usize {
        self.scoped(owner)
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .filter(|r| self.cancel(r.id).is_ok())
            .count()
    }

    pub fn remove_all(&self, owner: Option<&str>) -> usize {
        self.scoped(owner)
            .into_iter()
            .filter(|r| self.remove(r.id).is_ok())
            .count()
    }

    // -- queries -----------------------------------------------------------------

    pub fn get(&self, id: Uuid) -> Option<Transfer> {
        self.shared.record(id).map(|r| self.shared.handle(r.id))
    }

    /// A copy of a transfer's record.
    pub fn record(&self, id: Uuid) -> Option<TransferRecord> {
        self.shared.record(id)
    }

    fn transfers_where(&self, predicate: impl Fn(&TransferRecord) -> bool) -> Vec<Transfer> {
        self.shared
            .records()
            .into_iter()
            .filter(|r| predicate(r))
            .map(|r| self.shared.handle(r.id))
            .collect()
    }

    /// Every transfer, oldest first.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers_where(|_| true)
    }

    pub fn transfers_for_owner(&self, owner: &str) -> Vec<Transfer> {
        self.transfers_where(|r| r.owner_tag == owner)
    }

    pub fn downloads(&self) -> Vec<Transfer> {
        self.transfers_where(|r| r.transfer_type() == TransferType::Download)
    }

    pub fn uploads(&self) -> Vec<Transfer> {
        self.transfers_where(|r| r.transfer_type() == TransferType::Upload)
    }

    pub fn find_by_source(&self, source: &str) -> Vec<Transfer> {
        self.transfers_where(|r| r.source() == source)
    }

    pub fn find_by_destination(&self, destination: &str) -> Vec<Transfer> {
        self.transfers_where(|r| r.destination() == destination)
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        lock(&self.shared.session).cancel();
    }
}
