//! Caller-facing handle to one managed transfer.

use std::sync::Arc;

use uuid::Uuid;

use blobxfer_protocol::{TransferProgress, TransferState, TransferType};
use blobxfer_transfer::{TransferError, TransferRecord};

use crate::manager::Shared;

/// A managed transfer.
///
/// Cheap to clone. The handle stays valid after the transfer is removed,
/// at which point it reports [`TransferState::Deleted`].
#[derive(Clone)]
pub struct Transfer {
    id: Uuid,
    shared: Arc<Shared>,
}

impl Transfer {
    pub(crate) fn new(id: Uuid, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The current record, or `None` once removed.
    pub fn record(&self) -> Option<TransferRecord> {
        self.shared.record(self.id)
    }

    pub fn state(&self) -> TransferState {
        self.record().map_or(TransferState::Deleted, |r| r.state)
    }

    pub fn progress(&self) -> TransferProgress {
        self.record().map(|r| r.progress()).unwrap_or_default()
    }

    pub fn transfer_type(&self) -> Option<TransferType> {
        self.record().map(|r| r.transfer_type())
    }

    pub fn pause(&self) -> Result<TransferState, TransferError> {
        self.shared.pause(self.id)
    }

    pub fn resume(&self) -> Result<TransferState, TransferError> {
        self.shared.resume(self.id)
    }

    pub fn cancel(&self) -> Result<TransferState, TransferError> {
        self.shared.cancel(self.id)
    }

    pub fn remove(&self) -> Result<(), TransferError> {
        self.shared.remove(self.id)
    }
}

impl PartialEq for Transfer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transfer {}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
