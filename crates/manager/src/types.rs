use std::sync::Arc;

use uuid::Uuid;

use blobxfer_protocol::{TransferProgress, TransferState};
use blobxfer_transfer::{TransferError, Transport};

use crate::config::ClientOptions;
use crate::transfer::Transfer;

/// A client allowed to own transfers.
///
/// The transport is what restored transfers of this owner are sent
/// through, which is why a transfer cannot resume without its owner.
#[derive(Clone)]
pub struct ClientRegistration {
    pub options: ClientOptions,
    pub transport: Arc<dyn Transport>,
}

impl ClientRegistration {
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>) -> Self {
        Self { options, transport }
    }

    pub fn restoration_id(&self) -> &str {
        &self.options.restoration_id
    }
}

/// Callbacks for transfer lifecycle changes.
///
/// Every callback fires after the change it reports has been persisted.
pub trait TransferDelegate: Send + Sync {
    /// A state change, or new progress in the same state.
    fn on_state_changed(
        &self,
        _transfer: &Transfer,
        _state: TransferState,
        _progress: TransferProgress,
    ) {
    }

    /// The transfer has failed and will not be retried automatically.
    fn on_failed(&self, _transfer: &Transfer, _error: &TransferError) {}

    fn on_completed(&self, _transfer: &Transfer) {}
}

/// Events emitted by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StateChanged {
        id: Uuid,
        state: TransferState,
        progress: TransferProgress,
    },
    Failed {
        id: Uuid,
        error: String,
    },
    Completed {
        id: Uuid,
    },
}
